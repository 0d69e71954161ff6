//! Backend-independent job bookkeeping.
//!
//! Every [`JobStore`](super::JobStore) operation is a pure function of the job
//! table and the clock. Backends only decide how the table is locked, loaded
//! and written back.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use super::entry::{AckOutcome, JobEntry, JobFailure, JobState, Lease, NackOutcome};
use super::events::QueueMetrics;
use super::traits::StoreSettings;
use super::JobError;
use crate::mail::Delivery;

#[derive(Debug, Default)]
pub(crate) struct JobTable {
    pub entries: HashMap<Uuid, JobEntry>,
    pub paused: bool,
    pub next_seq: u64,
    tracking: bool,
    touched: HashSet<Uuid>,
    dropped: HashSet<Uuid>,
}

impl JobTable {
    pub fn from_entries(entries: impl IntoIterator<Item = JobEntry>, paused: bool) -> Self {
        let entries: HashMap<Uuid, JobEntry> = entries.into_iter().map(|e| (e.id, e)).collect();
        let next_seq = entries.values().map(|e| e.seq + 1).max().unwrap_or(0);
        Self {
            entries,
            paused,
            next_seq,
            tracking: true,
            ..Default::default()
        }
    }

    /// Ids written and ids deleted since the last call. Only tables built with
    /// [`JobTable::from_entries`] record changes.
    pub fn take_changes(&mut self) -> (Vec<Uuid>, Vec<Uuid>) {
        let dropped: Vec<Uuid> = self.dropped.drain().collect();
        let touched = self
            .touched
            .drain()
            .filter(|id| self.entries.contains_key(id))
            .collect();
        (touched, dropped)
    }

    fn touch(&mut self, id: Uuid) {
        if self.tracking {
            self.touched.insert(id);
        }
    }

    fn drop_entry(&mut self, id: Uuid) {
        self.entries.remove(&id);
        if self.tracking {
            self.touched.remove(&id);
            self.dropped.insert(id);
        }
    }

    pub fn insert(&mut self, mut entry: JobEntry) -> Result<JobEntry, JobError> {
        if self.entries.contains_key(&entry.id) {
            return Err(JobError::Duplicate(entry.id));
        }
        entry.seq = self.next_seq;
        self.next_seq += 1;
        self.touch(entry.id);
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    pub fn dequeue(&mut self, worker: &str, now: OffsetDateTime) -> Option<Lease> {
        if self.paused {
            return None;
        }

        let id = self
            .entries
            .values()
            .filter(|e| e.is_ready(now))
            .max_by_key(|e| (e.priority, Reverse(e.seq)))
            .map(|e| e.id)?;

        let entry = self.entries.get_mut(&id)?;
        let token = entry.activate(worker, now);
        let job = entry.clone();
        self.touch(id);

        Some(Lease {
            job,
            token,
            worker: worker.to_string(),
        })
    }

    pub fn ack(
        &mut self,
        lease: &Lease,
        delivery: &Delivery,
        settings: &StoreSettings,
        now: OffsetDateTime,
    ) -> Result<AckOutcome, JobError> {
        let id = lease.id();
        let Some(entry) = self.entries.get_mut(&id) else {
            // Already acked and dropped.
            if settings.remove_on_complete && lease.job.repeat.is_none() {
                return Ok(AckOutcome::AlreadyCompleted);
            }
            return Err(JobError::NotFound(id));
        };
        let outcome = entry.ack(lease.token, delivery, now);

        match outcome {
            AckOutcome::Completed if settings.remove_on_complete => {
                self.drop_entry(id);
                Ok(AckOutcome::Removed)
            }
            AckOutcome::Completed | AckOutcome::Rescheduled { .. } => {
                self.touch(id);
                Ok(outcome)
            }
            _ => Ok(outcome),
        }
    }

    pub fn nack(
        &mut self,
        lease: &Lease,
        failure: &JobFailure,
        settings: &StoreSettings,
        now: OffsetDateTime,
    ) -> Result<NackOutcome, JobError> {
        let id = lease.id();
        let entry = self.entries.get_mut(&id).ok_or(JobError::NotFound(id))?;
        let outcome = entry.nack(lease.token, failure, &settings.backoff, now);
        if outcome != NackOutcome::Stale {
            self.touch(id);
        }
        Ok(outcome)
    }

    pub fn progress(&mut self, lease: &Lease, percent: u8) -> Result<bool, JobError> {
        let id = lease.id();
        let entry = self.entries.get_mut(&id).ok_or(JobError::NotFound(id))?;
        if entry.state != JobState::Active || entry.lease != Some(lease.token) {
            return Ok(false);
        }
        entry.progress = percent.min(100);
        self.touch(id);
        Ok(true)
    }

    pub fn retry(&mut self, id: Uuid, now: OffsetDateTime) -> Result<JobEntry, JobError> {
        let entry = self.entries.get_mut(&id).ok_or(JobError::NotFound(id))?;
        entry
            .requeue(now)
            .map_err(|state| JobError::InvalidState { id, state })?;
        let entry = entry.clone();
        self.touch(id);
        Ok(entry)
    }

    /// Removes any job not currently active. Active jobs are left alone.
    pub fn remove(&mut self, id: Uuid) -> Result<bool, JobError> {
        let entry = self.entries.get(&id).ok_or(JobError::NotFound(id))?;
        if entry.state == JobState::Active {
            return Ok(false);
        }
        self.drop_entry(id);
        Ok(true)
    }

    /// Expire leases older than `visibility` and put the jobs straight back
    /// in the ready set. Returns the affected jobs in their new state
    /// (waiting, or failed when out of attempts).
    pub fn mark_stalled(&mut self, visibility: Duration, now: OffsetDateTime) -> Vec<JobEntry> {
        let expired: Vec<Uuid> = self
            .entries
            .values()
            .filter(|e| e.is_lease_expired(visibility, now))
            .map(|e| e.id)
            .collect();

        let mut stalled = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.stall(now);
                if entry.state == JobState::Stalled {
                    // Always succeeds from STALLED.
                    let _ = entry.requeue(now);
                }
                stalled.push(entry.clone());
                self.touch(id);
            }
        }
        stalled
    }

    pub fn metrics(&self, now: OffsetDateTime) -> QueueMetrics {
        let mut metrics = QueueMetrics::default();
        for entry in self.entries.values() {
            match entry.state {
                JobState::Active => metrics.active += 1,
                JobState::Completed => metrics.completed += 1,
                JobState::Failed => metrics.failed += 1,
                JobState::Delayed if entry.run_at > now => metrics.delayed += 1,
                JobState::Waiting | JobState::Delayed | JobState::Stalled => {
                    if self.paused {
                        metrics.paused += 1;
                    } else {
                        metrics.waiting += 1;
                    }
                }
            }
        }
        metrics
    }

    /// Remove up to `limit` jobs in `state` that have been idle for at least
    /// `older_than`, oldest first. A limit of zero removes all of them.
    pub fn clean(
        &mut self,
        older_than: Duration,
        limit: usize,
        state: JobState,
        now: OffsetDateTime,
    ) -> Result<Vec<Uuid>, JobError> {
        if state == JobState::Active {
            return Err(JobError::Other("active jobs cannot be cleaned".into()));
        }

        let Some(cutoff) = time::Duration::try_from(older_than)
            .ok()
            .and_then(|age| now.checked_sub(age))
        else {
            // Nothing can be that old.
            return Ok(Vec::new());
        };
        let mut candidates: Vec<(OffsetDateTime, Uuid)> = self
            .entries
            .values()
            .filter(|e| e.state == state)
            .map(|e| (e.finished_at.unwrap_or(e.created_at), e.id))
            .filter(|(at, _)| *at <= cutoff)
            .collect();
        candidates.sort();
        if limit > 0 {
            candidates.truncate(limit);
        }

        let removed: Vec<Uuid> = candidates.into_iter().map(|(_, id)| id).collect();
        for id in &removed {
            self.drop_entry(*id);
        }
        Ok(removed)
    }
}
