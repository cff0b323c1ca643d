use std::time::Duration;

use thiserror::Error;

/// Typed failures that callers are expected to branch on. Everything else
/// travels as `anyhow::Error`.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The job template or configuration cannot produce a valid job.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed project name '{name}': {reason}")]
    MalformedName { name: String, reason: String },

    #[error("malformed submission output: {0:?}")]
    MalformedJobId(String),

    #[error("wait cancelled while {0}")]
    Cancelled(String),

    #[error("deadline of {limit:?} exceeded while {what}")]
    DeadlineExceeded { what: String, limit: Duration },
}

impl RelayError {
    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Config(msg.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, RelayError::Config(_))
    }
}
