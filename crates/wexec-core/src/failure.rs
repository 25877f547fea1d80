use serde::{Deserialize, Serialize};

use crate::error::ExecutorError;

/// A serialized failure, as carried by a `RESPONSE` envelope's `data.failure`
/// field or as the terminal value of a failed request's promise.
///
/// Workers and the executor both produce these; neither side needs to know
/// the other's native error type, only this wire-stable shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Human-readable description of what went wrong.
    pub message: String,
    /// Machine-readable detail, e.g. the remote exception type and traceback.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl FailureRecord {
    /// Build a failure record with no structured detail.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Build a failure record with structured detail attached.
    pub fn with_details(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            message: message.into(),
            details,
        }
    }
}

impl std::fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ExecutorError> for FailureRecord {
    fn from(err: ExecutorError) -> Self {
        FailureRecord::new(err.to_string())
    }
}
