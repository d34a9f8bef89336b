/// Errors raised by the event-bus layer.
///
/// Every variant except [`BrokerError::Publish`] is fatal to the consumer:
/// it propagates out of the consume loop and terminates the process so a
/// supervisor can restart it from a clean connect.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Failed to establish a connection or open a channel.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Exchange, queue or binding declaration failed.
    #[error("Topology declaration failed: {0}")]
    Topology(String),

    /// The consumer stream reported an error.
    #[error("Consume error: {0}")]
    Consume(String),

    /// Acknowledging or rejecting a delivery failed.
    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    /// Publishing an outbound event failed or was nacked by the broker.
    #[error("Publish failed: {0}")]
    Publish(String),
}
