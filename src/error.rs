// Engine error taxonomy.
//
// Retry decisions hinge on the class of a failure, not its message:
// transient delivery errors back off and retry, permanent and
// configuration errors fail the enrollment immediately, infrastructure
// errors abort the current tick for that enrollment and let the claim
// lease expire.

use thiserror::Error;
use tokio_cron_scheduler::JobSchedulerError;

use crate::workflows::enrollment::EnrollmentStatus;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] JobSchedulerError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("contact directory error: {0}")]
    Directory(String),

    #[error("invalid enrollment transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    },
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Delivery failures reported by the outbound message channel.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SendError {
    #[error("send timed out after {0}s")]
    Timeout(u64),

    #[error("channel transport error: {0}")]
    Network(String),

    #[error("transient delivery error (status {status}): {message}")]
    Transient { status: u16, message: String },

    #[error("permanent delivery error: {0}")]
    Permanent(String),
}

impl SendError {
    /// Transient errors and timeouts take the backoff/retry path;
    /// permanent rejections fail the enrollment on the spot.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SendError::Permanent(_))
    }
}
