use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use super::entry::{AckOutcome, FailureClass, JobEntry, JobFailure, JobState, Lease, NackOutcome};
use super::events::{EventBus, JobEvent, QueueMetrics};
use super::traits::JobStore;
use super::JobError;
use crate::mail::Delivery;

/// A [`JobStore`] that reports every transition on an [`EventBus`].
///
/// Workers and the service facade talk to the queue, never to the store
/// directly, so observers see a consistent event stream regardless of
/// backend.
#[derive(Clone)]
pub struct Queue<S: JobStore> {
    store: S,
    events: EventBus,
}

impl<S: JobStore> Queue<S> {
    pub fn new(store: S) -> Self {
        Self::with_events(store, EventBus::default())
    }

    pub fn with_events(store: S, events: EventBus) -> Self {
        Self { store, events }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub async fn add(&self, entry: JobEntry) -> Result<JobEntry, JobError> {
        let entry = self.store.enqueue(entry).await?;
        tracing::debug!(job_id = %entry.id, state = %entry.state, priority = ?entry.priority, "job queued");
        self.events.publish(JobEvent::Queued {
            id: entry.id,
            state: entry.state,
        });
        Ok(entry)
    }

    pub async fn add_bulk(&self, entries: Vec<JobEntry>) -> Result<Vec<JobEntry>, JobError> {
        let entries = self.store.enqueue_bulk(entries).await?;
        tracing::debug!(count = entries.len(), "jobs queued");
        for entry in &entries {
            self.events.publish(JobEvent::Queued {
                id: entry.id,
                state: entry.state,
            });
        }
        Ok(entries)
    }

    /// Claim the next ready job for `worker_id`.
    pub async fn next(&self, worker_id: &str) -> Result<Option<Lease>, JobError> {
        let lease = self.store.dequeue(worker_id).await?;
        if let Some(lease) = &lease {
            self.events.publish(JobEvent::Active {
                id: lease.id(),
                attempt: lease.job.attempts,
                worker: lease.worker.clone(),
            });
        }
        Ok(lease)
    }

    pub async fn complete(&self, lease: &Lease, delivery: &Delivery) -> Result<AckOutcome, JobError> {
        let outcome = self.store.ack(lease, delivery).await?;
        let id = lease.id();
        match &outcome {
            AckOutcome::Completed | AckOutcome::Removed => {
                self.events.publish(JobEvent::Completed {
                    id,
                    message_id: delivery.message_id.clone(),
                });
            }
            AckOutcome::Rescheduled { run_at } => {
                self.events.publish(JobEvent::Rescheduled {
                    id,
                    message_id: delivery.message_id.clone(),
                    run_at: *run_at,
                });
            }
            AckOutcome::AlreadyCompleted | AckOutcome::Stale => {
                tracing::debug!(job_id = %id, ?outcome, "ack ignored");
            }
        }
        Ok(outcome)
    }

    pub async fn fail(&self, lease: &Lease, failure: &JobFailure) -> Result<NackOutcome, JobError> {
        let outcome = self.store.nack(lease, failure).await?;
        let id = lease.id();
        match &outcome {
            NackOutcome::Retrying { attempt, delay, .. } => {
                self.events.publish(JobEvent::Retrying {
                    id,
                    attempt: *attempt,
                    delay: *delay,
                    error: failure.message.clone(),
                });
            }
            NackOutcome::Failed => {
                self.events.publish(JobEvent::Failed {
                    id,
                    class: failure.class,
                    error: failure.message.clone(),
                    attempts: lease.job.attempts,
                });
            }
            NackOutcome::Stale => {
                tracing::debug!(job_id = %id, "nack ignored, lease superseded");
            }
        }
        Ok(outcome)
    }

    pub async fn progress(&self, lease: &Lease, percent: u8) -> Result<(), JobError> {
        if self.store.progress(lease, percent).await? {
            self.events.publish(JobEvent::Progress {
                id: lease.id(),
                percent: percent.min(100),
            });
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<JobEntry>, JobError> {
        self.store.get(id).await
    }

    pub async fn retry(&self, id: Uuid) -> Result<JobEntry, JobError> {
        let entry = self.store.retry(id).await?;
        tracing::info!(job_id = %id, attempts = entry.attempts, "job requeued");
        self.events.publish(JobEvent::Waiting { id });
        Ok(entry)
    }

    pub async fn remove(&self, id: Uuid) -> Result<bool, JobError> {
        let removed = self.store.remove(id).await?;
        if removed {
            self.events.publish(JobEvent::Removed { id });
        }
        Ok(removed)
    }

    /// Expire overdue leases. The store puts stalled jobs back in the ready
    /// set in the same step. Returns the number of jobs that stalled.
    pub async fn recover_stalled(&self) -> Result<usize, JobError> {
        let stalled = self.store.mark_stalled().await?;

        for job in &stalled {
            tracing::warn!(job_id = %job.id, stalls = job.stalls, attempts = job.attempts, "job stalled");
            self.events.publish(JobEvent::Stalled {
                id: job.id,
                stalls: job.stalls,
            });

            match job.state {
                JobState::Waiting => self.events.publish(JobEvent::Waiting { id: job.id }),
                JobState::Failed => self.events.publish(JobEvent::Failed {
                    id: job.id,
                    class: FailureClass::Stalled,
                    error: job.last_error.clone().unwrap_or_default(),
                    attempts: job.attempts,
                }),
                _ => {}
            }
        }

        Ok(stalled.len())
    }

    pub async fn pause(&self) -> Result<(), JobError> {
        self.store.pause().await?;
        tracing::info!("queue paused");
        self.events.publish(JobEvent::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), JobError> {
        self.store.resume().await?;
        tracing::info!("queue resumed");
        self.events.publish(JobEvent::Resumed);
        Ok(())
    }

    pub async fn is_paused(&self) -> Result<bool, JobError> {
        self.store.is_paused().await
    }

    pub async fn metrics(&self) -> Result<QueueMetrics, JobError> {
        self.store.metrics().await
    }

    pub async fn clean(
        &self,
        older_than: Duration,
        limit: usize,
        state: JobState,
    ) -> Result<Vec<Uuid>, JobError> {
        let removed = self.store.clean(older_than, limit, state).await?;
        if !removed.is_empty() {
            tracing::info!(%state, count = removed.len(), "queue cleaned");
            self.events.publish(JobEvent::Cleaned {
                state,
                count: removed.len(),
            });
        }
        Ok(removed)
    }
}
