//! Errors surfaced by queue operations.

use thiserror::Error;

use notiq_core::QueueItemId;

use crate::store::StoreError;

/// Call-level error of a queue operation.
///
/// Per-item delivery failures never show up here; they are recorded on the
/// item by the retry policy.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue item not found: {0}")]
    NotFound(QueueItemId),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
