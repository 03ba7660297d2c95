//! Staff service errors.

use thiserror::Error;

use crate::messaging::MessagingError;

#[derive(Debug, Error)]
pub enum StaffError {
    #[error("{0}")]
    Validation(String),

    #[error("Staff not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    /// The mutation was stored but its event could not be published.
    #[error("event publish failed: {0}")]
    EventPublish(#[from] MessagingError),
}

pub type StaffResult<T> = Result<T, StaffError>;
