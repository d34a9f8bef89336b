//! Broker-agnostic seams used by the orchestrator.
//!
//! The AMQP implementations live in [`crate::amqp`]; in-memory doubles for
//! tests live in [`crate::memory`].

use std::fmt;

use async_trait::async_trait;

use crate::error::BrokerError;

/// Settles one inbound delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    /// Negative acknowledgement. `requeue = false` drops the message.
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message received from the broker, not yet acknowledged.
pub struct InboundDelivery {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl InboundDelivery {
    pub fn new(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        redelivered: bool,
        acker: impl Acknowledge + 'static,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            redelivered,
            acker: Box::new(acker),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the broker has delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Source of inbound deliveries.
///
/// `None` means the broker closed the consumer; `Some(Err(_))` is a
/// broker-level failure.
#[async_trait]
pub trait DeliveryStream: Send {
    async fn next_delivery(&mut self) -> Option<Result<InboundDelivery, BrokerError>>;
}

/// Publishing side of one dedicated broker connection.
#[async_trait]
pub trait EventPublisher: Send {
    async fn publish(&mut self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Close the underlying connection. Errors are logged, not returned.
    async fn close(self: Box<Self>);
}

/// Opens a fresh publisher connection per unit of work.
#[async_trait]
pub trait PublisherFactory: Send + Sync {
    /// Blocks until a connection is available; never fails.
    async fn open(&self) -> Box<dyn EventPublisher>;
}
