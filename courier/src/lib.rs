//! Asynchronous transactional email delivery.
//!
//! Emails are queued as jobs, rendered from typed templates, and sent by a
//! bounded worker pool with exponential backoff, stall recovery and
//! lifecycle events. Delivery is at-least-once.
//!
//! ```ignore
//! let service = EmailService::in_memory(CourierConfig::load()?, SmtpMailer::from_env(5)?);
//! let mut events = service.subscribe();
//!
//! let id = service.send_welcome("ada@example.com", "Ada", "https://playdoo.app").await?;
//! while let Ok(event) = events.recv().await {
//!     if event.job_id() == Some(id) && event.name() == "job:completed" {
//!         break;
//!     }
//! }
//! service.close().await;
//! ```

pub mod config;
pub mod error;
pub mod jobs;
pub mod mail;
pub mod service;
pub mod templates;

pub use config::{CourierConfig, EnvConfig};
pub use error::{Error, Result};
pub use jobs::{JobEntry, JobEvent, JobOpts, JobState, Priority, QueueMetrics};
pub use mail::{EmailData, Mailer};
pub use service::EmailService;
pub use templates::{EmailTemplate, Renderer, TemplateId};
