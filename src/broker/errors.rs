use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker not connected")]
    NotConnected,

    #[error("Broker client closed")]
    Closed,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors returned by delivery handlers
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Processing failed; the delivery goes through the retry policy
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The payload can never be processed; the delivery is dead-lettered directly
    #[error("Malformed payload: {0}")]
    Malformed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        HandlerError::Malformed(msg.into())
    }
}
