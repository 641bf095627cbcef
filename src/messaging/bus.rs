use async_trait::async_trait;

use crate::utils::IsTransient;

// ============================================================================
// Message Bus Port
// ============================================================================
//
// A publish call returns only after the bus confirmed the write. Transient
// failures are retried by the caller; permanent ones mean this exact message
// will never be accepted.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    /// Partition key; all messages of one aggregate share it
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl BusMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PublishError {
    /// Bus unavailable, timed out or circuit open
    #[error("transient publish failure: {0}")]
    Transient(String),

    /// Message rejected (too large, invalid, unencodable)
    #[error("permanent publish failure: {0}")]
    Permanent(String),
}

impl IsTransient for PublishError {
    fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: &BusMessage) -> Result<(), PublishError>;
}
