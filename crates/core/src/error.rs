#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Malformed message on '{routing_key}': {reason}")]
    MalformedMessage { routing_key: String, reason: String },

    #[error("Unknown routing key: {0}")]
    UnknownRoutingKey(String),
}
