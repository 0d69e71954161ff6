//! Message composition and the mail transport boundary.
//!
//! This module provides a thin abstraction over [lettre](https://lettre.rs):
//! the queue only ever needs [`Mailer::send`] on a fully composed [`Email`].
//!
//! # Quick Start
//!
//! ```ignore
//! // 1. Initialize mailer from environment, limited to 5 pooled connections
//! let mailer = SmtpMailer::from_env(5)?;
//!
//! // 2. Bound concurrency and space sends 100ms apart
//! let mailer = Throttled::new(mailer, 5, Duration::from_millis(100));
//!
//! // 3. Send directly
//! let email = Email::builder()
//!     .from("noreply@playdoo.app")
//!     .to("user@example.com")
//!     .subject("Welcome!")
//!     .text("Thanks for signing up.")
//!     .build()?;
//! let delivery = mailer.send(&email).await?;
//! ```
//!
//! # Environment Variables
//!
//! The [`SmtpMailer::from_env`] method reads:
//!
//! | Variable | Required | Description |
//! |----------|----------|-------------|
//! | `SMTP_HOST` | Yes | SMTP server hostname |
//! | `SMTP_PORT` | No | Port (default: 587) |
//! | `SMTP_USERNAME` | No | Username for authentication |
//! | `SMTP_PASSWORD` | No | Password for authentication |
//! | `SMTP_FROM` | Yes | Default sender address |
//! | `SMTP_TLS` | No | `starttls` (default), `tls`, or `none` |
//! | `SMTP_TIMEOUT` | No | Connection timeout in seconds (default: 10) |

mod job;
mod mailer;
mod message;
mod throttle;

pub use job::{EmailData, JOB_ID_HEADER};
pub use mailer::{Delivery, LogMailer, Mailer, MailerConfig, SmtpMailer};
pub use message::{Attachment, Email, EmailBody, EmailBuilder};
pub use throttle::Throttled;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MailError {
    #[error("missing required config: {0}")]
    MissingConfig(String),

    #[error("invalid email address: {0}")]
    InvalidAddress(String),

    #[error("failed to build message: {0}")]
    Build(String),

    /// Permanent rejection by the provider (5xx).
    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("SMTP error: {0}")]
    Smtp(String),
}

impl MailError {
    /// Whether sending the same message again might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Smtp(_))
    }
}
