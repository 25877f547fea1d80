use std::time::Duration;

/// Errors produced by the worker-based task executor.
///
/// Variants that terminate a single in-flight request (`RequestTimeout`,
/// `PublishError`) are delivered through that request's promise, never as a
/// `Result::Err` from a public operation. The remaining variants are either
/// dropped after logging (`InvalidResponse`, `UnknownCorrelation`) or surface
/// as an ordinary `Result::Err` from a misused public operation
/// (`NotStarted`, `AlreadyStarted`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    /// A request's timeout elapsed before it reached a terminal state.
    #[error("request timed out after waiting {waited:?} in state(s) {states:?}")]
    RequestTimeout {
        /// How long the request waited before being reaped.
        waited: Duration,
        /// The non-terminal states the request was observed in.
        states: Vec<String>,
    },

    /// The transport refused to publish a request after exhausting retries.
    #[error("failed to publish request: {0}")]
    PublishError(String),

    /// An inbound response failed envelope or body validation.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// A response referenced a correlation id with no matching request.
    #[error("response referenced an unknown correlation id")]
    UnknownCorrelation,

    /// The executor was asked to act before `start()` completed.
    #[error("executor has not been started")]
    NotStarted,

    /// `start()` was called on an executor that is already running.
    #[error("executor is already started")]
    AlreadyStarted,
}
