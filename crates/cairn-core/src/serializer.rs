//! State serializer capability.

use thiserror::Error;

/// Error raised by a [`StateSerializer`].
#[derive(Debug, Error)]
#[error("{format} serializer: {message}")]
pub struct SerializerError {
    /// Name of the wire format.
    pub format: &'static str,
    /// Underlying error message.
    pub message: String,
}

/// Converts aggregate state between its structured form and an opaque blob.
pub trait StateSerializer: Send + Sync {
    /// Name of the wire format.
    fn format(&self) -> &'static str;

    /// Encode a structured value into a blob.
    ///
    /// # Errors
    ///
    /// Returns `SerializerError` when the value cannot be encoded.
    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, SerializerError>;

    /// Decode a blob produced by [`encode`](StateSerializer::encode).
    ///
    /// # Errors
    ///
    /// Returns `SerializerError` when the blob is malformed.
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, SerializerError>;
}

/// JSON serializer; the default format for snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl StateSerializer for JsonSerializer {
    fn format(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &serde_json::Value) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(value).map_err(|e| SerializerError {
            format: "json",
            message: e.to_string(),
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, SerializerError> {
        serde_json::from_slice(bytes).map_err(|e| SerializerError {
            format: "json",
            message: e.to_string(),
        })
    }
}
