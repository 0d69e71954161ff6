//! Durable email job queue with priorities, retry, stall recovery and events.
//!
//! # Architecture
//!
//! - [`JobEntry`]: one queued email plus its scheduling state. All state
//!   transitions live on the entry.
//! - [`JobStore`]: backend-agnostic storage trait. Every method is atomic.
//! - [`MemoryStore`]: in-process store for development and testing.
//! - `RedisStore` (feature `redis`): shared store for multi-process workers.
//! - [`Queue`]: a store that publishes [`JobEvent`]s on every transition.
//! - [`WorkerPool`]: fixed-concurrency processors plus stall recovery.
//! - [`Schedule`]: cron expressions for recurring jobs.
//!
//! # Lifecycle
//!
//! ```text
//! waiting/delayed ── dequeue ──▶ active ── ack ──▶ completed (delayed again if recurring)
//! active ── nack, attempts left ──▶ delayed
//! active ── nack, otherwise ──▶ failed ── retry ──▶ waiting
//! active ── lease expired ──▶ stalled ──▶ waiting (same store operation)
//! active ── lease expired, attempts spent ──▶ failed
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! let queue = Queue::new(MemoryStore::new(StoreSettings::default()));
//! let entry = JobEntry::new(email_data, &JobOpts::default(), 3);
//! queue.add(entry).await?;
//!
//! let ctx = WorkerContext::new(renderer, mailer, "noreply@playdoo.app");
//! let pool = WorkerPool::spawn(queue.clone(), ctx, WorkerOptions::default());
//! ```

mod backoff;
mod entry;
mod events;
mod memory;
mod queue;
#[cfg(feature = "redis")]
mod redis;
mod scheduler;
mod table;
mod traits;
mod worker;

pub use backoff::BackoffPolicy;
pub use entry::{
    AckOutcome, FailureClass, JobEntry, JobFailure, JobOpts, JobResult, JobState, Lease,
    NackOutcome, Priority,
};
pub use events::{EventBus, JobEvent, QueueMetrics};
pub use memory::MemoryStore;
pub use queue::Queue;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use scheduler::Schedule;
pub use traits::{JobStore, StoreSettings};
pub use worker::{WorkerContext, WorkerOptions, WorkerPool};

use uuid::Uuid;

// -------------------------------------------------------------------------
// Errors
// -------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The store could not be reached. Nothing was changed.
    #[error("job store unavailable: {0}")]
    BackendUnavailable(String),
    #[error("job not found: {0}")]
    NotFound(Uuid),
    #[error("job already exists: {0}")]
    Duplicate(Uuid),
    #[error("job {id} is {state}")]
    InvalidState { id: Uuid, state: JobState },
    #[error("invalid cron schedule: {0}")]
    InvalidCron(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}
