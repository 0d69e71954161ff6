use thiserror::Error;

use crate::config::ConfigError;
use crate::jobs::JobError;
use crate::mail::MailError;
use crate::templates::TemplateError;

/// Errors returned by [`EmailService`](crate::EmailService).
///
/// Delivery failures never surface here: once a job is queued, its outcome is
/// reported through job status and events.
#[derive(Debug, Error)]
pub enum Error {
    /// The request was rejected before anything was queued.
    #[error("invalid email request: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl Error {
    /// The job store could not be reached.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Self::Job(JobError::BackendUnavailable(_)))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
