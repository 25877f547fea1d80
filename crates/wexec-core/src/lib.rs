#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared types for the worker-based task executor: request identifiers, the
//! terminal failure representation, and the library-wide error enum.

mod error;
mod failure;

pub use error::ExecutorError;
pub use failure::FailureRecord;

/// Unique identifier for one dispatch attempt of one task.
pub type RequestUuid = uuid::Uuid;
