use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::entry::{AckOutcome, JobEntry, JobFailure, JobState, Lease, NackOutcome};
use super::events::QueueMetrics;
use super::table::JobTable;
use super::traits::{JobStore, StoreSettings};
use super::JobError;
use crate::mail::Delivery;

/// In-memory [`JobStore`] for development and testing.
///
/// Jobs live in a map behind a mutex. Not durable: all jobs are lost on
/// restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    table: Arc<Mutex<JobTable>>,
    settings: Arc<StoreSettings>,
}

impl MemoryStore {
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            table: Arc::default(),
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Number of jobs currently stored, in any state.
    pub async fn len(&self) -> usize {
        self.table.lock().await.entries.len()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, entry: JobEntry) -> Result<JobEntry, JobError> {
        self.table.lock().await.insert(entry)
    }

    async fn enqueue_bulk(&self, entries: Vec<JobEntry>) -> Result<Vec<JobEntry>, JobError> {
        let mut table = self.table.lock().await;
        if let Some(dup) = entries.iter().find(|e| table.entries.contains_key(&e.id)) {
            return Err(JobError::Duplicate(dup.id));
        }
        entries.into_iter().map(|e| table.insert(e)).collect()
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<Lease>, JobError> {
        let now = OffsetDateTime::now_utc();
        Ok(self.table.lock().await.dequeue(worker_id, now))
    }

    async fn ack(&self, lease: &Lease, delivery: &Delivery) -> Result<AckOutcome, JobError> {
        let now = OffsetDateTime::now_utc();
        self.table
            .lock()
            .await
            .ack(lease, delivery, &self.settings, now)
    }

    async fn nack(&self, lease: &Lease, failure: &JobFailure) -> Result<NackOutcome, JobError> {
        let now = OffsetDateTime::now_utc();
        self.table
            .lock()
            .await
            .nack(lease, failure, &self.settings, now)
    }

    async fn progress(&self, lease: &Lease, percent: u8) -> Result<bool, JobError> {
        self.table.lock().await.progress(lease, percent)
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobEntry>, JobError> {
        Ok(self.table.lock().await.entries.get(&id).cloned())
    }

    async fn retry(&self, id: Uuid) -> Result<JobEntry, JobError> {
        let now = OffsetDateTime::now_utc();
        self.table.lock().await.retry(id, now)
    }

    async fn remove(&self, id: Uuid) -> Result<bool, JobError> {
        self.table.lock().await.remove(id)
    }

    async fn mark_stalled(&self) -> Result<Vec<JobEntry>, JobError> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .table
            .lock()
            .await
            .mark_stalled(self.settings.visibility_timeout, now))
    }

    async fn pause(&self) -> Result<(), JobError> {
        self.table.lock().await.paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), JobError> {
        self.table.lock().await.paused = false;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, JobError> {
        Ok(self.table.lock().await.paused)
    }

    async fn metrics(&self) -> Result<QueueMetrics, JobError> {
        let now = OffsetDateTime::now_utc();
        Ok(self.table.lock().await.metrics(now))
    }

    async fn clean(
        &self,
        older_than: Duration,
        limit: usize,
        state: JobState,
    ) -> Result<Vec<Uuid>, JobError> {
        let now = OffsetDateTime::now_utc();
        self.table
            .lock()
            .await
            .clean(older_than, limit, state, now)
    }
}
