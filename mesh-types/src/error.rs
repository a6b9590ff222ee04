//! Error types for prepper-mesh wire messages.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum MessageError {
    /// JSON serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),

    /// JSON deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),

    /// Payload is structurally invalid (e.g. a required collection is missing)
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Message exceeds the maximum size accepted on a stream
    #[error("message too large: {size} > {limit}")]
    TooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        limit: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = MessageError::InvalidPayload("missing foodItems".into());
        assert_eq!(err.to_string(), "invalid payload: missing foodItems");

        let err = MessageError::TooLarge { size: 10, limit: 5 };
        assert_eq!(err.to_string(), "message too large: 10 > 5");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MessageError>();
    }
}
