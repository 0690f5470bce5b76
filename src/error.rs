use thiserror::Error;

/// Recoverable failures of a control request.
///
/// Every variant maps to a rejected request on the channel; none of them
/// leaves partial state behind. Invariant violations do not get a variant,
/// they abort the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Malformed request: missing field, wrong type, bad value.
    #[error("{0}")]
    Protocol(String),

    /// The id in the request does not resolve to a live entity.
    #[error("{0}")]
    NotFound(String),

    /// The entity already exists or a state invariant rejects the change.
    #[error("{0}")]
    Conflict(String),

    /// Out of a bounded resource (dynamic payload types).
    #[error("{0}")]
    Capacity(String),
}

impl WorkerError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        WorkerError::Protocol(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        WorkerError::NotFound(msg.into())
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> Self {
        WorkerError::Conflict(msg.into())
    }
}
