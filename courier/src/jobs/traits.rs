use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::backoff::BackoffPolicy;
use super::entry::{AckOutcome, JobEntry, JobFailure, JobState, Lease, NackOutcome};
use super::events::QueueMetrics;
use super::JobError;
use crate::mail::Delivery;

/// Retry and lease behaviour shared by every backend.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub backoff: BackoffPolicy,
    /// How long a job may stay active before it counts as stalled.
    pub visibility_timeout: Duration,
    /// Drop non-recurring jobs as soon as they complete.
    pub remove_on_complete: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            visibility_timeout: Duration::from_secs(30),
            remove_on_complete: false,
        }
    }
}

/// Backend-agnostic job storage.
///
/// Implement this trait to plug in any persistence layer (in-memory, Redis,
/// Postgres, etc.). Every method must be atomic with respect to every other:
/// two concurrent [`dequeue`](JobStore::dequeue) calls never return the same
/// job, and a job is never completed and retried at the same time.
///
/// Failures reaching the backend surface as
/// [`JobError::BackendUnavailable`].
#[async_trait]
pub trait JobStore: Send + Sync + Clone + 'static {
    /// Persist a new job. The store assigns its FIFO sequence number.
    async fn enqueue(&self, entry: JobEntry) -> Result<JobEntry, JobError>;

    /// Persist several jobs in one step, in order.
    async fn enqueue_bulk(&self, entries: Vec<JobEntry>) -> Result<Vec<JobEntry>, JobError>;

    /// Atomically claim the next ready job for `worker_id`.
    ///
    /// The implementation must:
    /// - Skip everything while the queue is paused
    /// - Select the highest-priority ready job, oldest first within a priority
    /// - Set it active, lock it to the worker and increment `attempts`
    /// - Return `None` when no job is ready
    async fn dequeue(&self, worker_id: &str) -> Result<Option<Lease>, JobError>;

    /// Mark a leased job as sent. Safe to repeat.
    async fn ack(&self, lease: &Lease, delivery: &Delivery) -> Result<AckOutcome, JobError>;

    /// Record a failed attempt and schedule the retry or fail the job.
    async fn nack(&self, lease: &Lease, failure: &JobFailure) -> Result<NackOutcome, JobError>;

    /// Record progress (0-100) for a leased job. Returns false when the lease
    /// is no longer current.
    async fn progress(&self, lease: &Lease, percent: u8) -> Result<bool, JobError>;

    async fn get(&self, id: Uuid) -> Result<Option<JobEntry>, JobError>;

    /// Move a failed or stalled job back to waiting.
    async fn retry(&self, id: Uuid) -> Result<JobEntry, JobError>;

    /// Delete a job unless it is active. Returns whether it was removed.
    async fn remove(&self, id: Uuid) -> Result<bool, JobError>;

    /// Expire overdue leases and requeue the jobs in the same atomic step.
    /// Returns them as waiting, or failed when their attempts are spent.
    async fn mark_stalled(&self) -> Result<Vec<JobEntry>, JobError>;

    async fn pause(&self) -> Result<(), JobError>;

    async fn resume(&self) -> Result<(), JobError>;

    async fn is_paused(&self) -> Result<bool, JobError>;

    async fn metrics(&self) -> Result<QueueMetrics, JobError>;

    /// Remove up to `limit` jobs in `state` idle for at least `older_than`.
    /// A limit of zero means no limit.
    async fn clean(
        &self,
        older_than: Duration,
        limit: usize,
        state: JobState,
    ) -> Result<Vec<Uuid>, JobError>;
}
