//! Redis-backed job store (feature `redis`).
//!
//! ## Layout
//!
//! - `{prefix}:jobs`: hash of job id to JSON-encoded [`JobEntry`]
//! - `{prefix}:seq`: next FIFO sequence number
//! - `{prefix}:paused`: present while the queue is paused
//!
//! Each operation runs as one optimistic transaction (WATCH/MULTI/EXEC) over
//! those keys, so concurrent workers in any number of processes never claim
//! the same job. Operations load the whole hash; this store targets the
//! volumes of a transactional mail queue, not bulk campaigns. Set a
//! retention (`COURIER_RETENTION_SECS`) so finished jobs do not grow the hash
//! forever.
//!
//! One connection per store is reused across operations and reopened after
//! any error.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::entry::{AckOutcome, JobEntry, JobFailure, JobState, Lease, NackOutcome};
use super::events::QueueMetrics;
use super::table::JobTable;
use super::traits::{JobStore, StoreSettings};
use super::JobError;
use crate::mail::Delivery;

const DEFAULT_PREFIX: &str = "courier";

#[derive(Debug)]
struct Keys {
    jobs: String,
    seq: String,
    paused: String,
}

#[derive(Clone)]
pub struct RedisStore {
    client: Arc<redis::Client>,
    conn: Arc<Mutex<Option<redis::Connection>>>,
    keys: Arc<Keys>,
    settings: Arc<StoreSettings>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("keys", &self.keys)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store for `redis_url` (e.g. `redis://localhost:6379`).
    /// Keys are namespaced under `prefix` (default: `courier`).
    pub fn new(
        redis_url: impl AsRef<str>,
        prefix: Option<String>,
        settings: StoreSettings,
    ) -> Result<Self, JobError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| JobError::BackendUnavailable(e.to_string()))?;
        let prefix = prefix.unwrap_or_else(|| DEFAULT_PREFIX.to_string());

        Ok(Self {
            client: Arc::new(client),
            conn: Arc::default(),
            keys: Arc::new(Keys {
                jobs: format!("{prefix}:jobs"),
                seq: format!("{prefix}:seq"),
                paused: format!("{prefix}:paused"),
            }),
            settings: Arc::new(settings),
        })
    }

    /// Run `op` against the current table and write back whatever it changed,
    /// retrying if another client touched the keys in between.
    async fn with_table<T, F>(&self, op: F) -> Result<T, JobError>
    where
        T: Send + 'static,
        F: Fn(&mut JobTable, &StoreSettings, OffsetDateTime) -> Result<T, JobError> + Send + 'static,
    {
        let client = self.client.clone();
        let slot = self.conn.clone();
        let keys = self.keys.clone();
        let settings = self.settings.clone();

        tokio::task::spawn_blocking(move || {
            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                let conn = client
                    .get_connection()
                    .map_err(|e| JobError::BackendUnavailable(e.to_string()))?;
                *slot = Some(conn);
            }
            let Some(conn) = slot.as_mut() else {
                return Err(JobError::BackendUnavailable("no redis connection".into()));
            };

            let watched = [keys.jobs.as_str(), keys.seq.as_str(), keys.paused.as_str()];
            let result = redis::transaction(conn, &watched, |conn, pipe| {
                let raw: HashMap<String, String> =
                    redis::cmd("HGETALL").arg(&keys.jobs).query(conn)?;
                let paused: bool = redis::cmd("EXISTS").arg(&keys.paused).query(conn)?;
                let stored_seq: Option<u64> = redis::cmd("GET").arg(&keys.seq).query(conn)?;

                let entries = raw
                    .values()
                    .map(|json| serde_json::from_str::<JobEntry>(json))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(json_error)?;
                let mut table = JobTable::from_entries(entries, paused);
                table.next_seq = table.next_seq.max(stored_seq.unwrap_or(0));
                let seq_before = table.next_seq;

                let value = match op(&mut table, &settings, OffsetDateTime::now_utc()) {
                    Ok(value) => value,
                    Err(e) => return Ok(Some(Err(e))),
                };

                let (touched, dropped) = table.take_changes();
                let unchanged = touched.is_empty()
                    && dropped.is_empty()
                    && table.paused == paused
                    && table.next_seq == seq_before;
                if unchanged {
                    return Ok(Some(Ok(value)));
                }

                for id in touched {
                    if let Some(entry) = table.entries.get(&id) {
                        let json = serde_json::to_string(entry).map_err(json_error)?;
                        pipe.hset(&keys.jobs, id.to_string(), json).ignore();
                    }
                }
                for id in dropped {
                    pipe.hdel(&keys.jobs, id.to_string()).ignore();
                }
                if table.paused != paused {
                    if table.paused {
                        pipe.set(&keys.paused, 1).ignore();
                    } else {
                        pipe.del(&keys.paused).ignore();
                    }
                }
                if table.next_seq != seq_before {
                    pipe.set(&keys.seq, table.next_seq).ignore();
                }

                let committed: Option<()> = pipe.query(conn)?;
                Ok(committed.map(|()| Ok(value)))
            });

            match result {
                Ok(result) => result,
                Err(e) => {
                    // The connection may still hold a WATCH or be broken.
                    *slot = None;
                    Err(redis_error(e))
                }
            }
        })
        .await
        .map_err(|e| JobError::Other(format!("redis task failed: {e}")))?
    }
}

fn json_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "invalid job entry", e.to_string()))
}

fn redis_error(e: redis::RedisError) -> JobError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        JobError::BackendUnavailable(e.to_string())
    } else {
        JobError::Other(format!("redis: {e}"))
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn enqueue(&self, entry: JobEntry) -> Result<JobEntry, JobError> {
        self.with_table(move |table, _, _| table.insert(entry.clone()))
            .await
    }

    async fn enqueue_bulk(&self, entries: Vec<JobEntry>) -> Result<Vec<JobEntry>, JobError> {
        self.with_table(move |table, _, _| {
            if let Some(dup) = entries.iter().find(|e| table.entries.contains_key(&e.id)) {
                return Err(JobError::Duplicate(dup.id));
            }
            entries.iter().cloned().map(|e| table.insert(e)).collect()
        })
        .await
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<Lease>, JobError> {
        let worker_id = worker_id.to_string();
        self.with_table(move |table, _, now| Ok(table.dequeue(&worker_id, now)))
            .await
    }

    async fn ack(&self, lease: &Lease, delivery: &Delivery) -> Result<AckOutcome, JobError> {
        let (lease, delivery) = (lease.clone(), delivery.clone());
        self.with_table(move |table, settings, now| table.ack(&lease, &delivery, settings, now))
            .await
    }

    async fn nack(&self, lease: &Lease, failure: &JobFailure) -> Result<NackOutcome, JobError> {
        let (lease, failure) = (lease.clone(), failure.clone());
        self.with_table(move |table, settings, now| table.nack(&lease, &failure, settings, now))
            .await
    }

    async fn progress(&self, lease: &Lease, percent: u8) -> Result<bool, JobError> {
        let lease = lease.clone();
        self.with_table(move |table, _, _| table.progress(&lease, percent))
            .await
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobEntry>, JobError> {
        self.with_table(move |table, _, _| Ok(table.entries.get(&id).cloned()))
            .await
    }

    async fn retry(&self, id: Uuid) -> Result<JobEntry, JobError> {
        self.with_table(move |table, _, now| table.retry(id, now)).await
    }

    async fn remove(&self, id: Uuid) -> Result<bool, JobError> {
        self.with_table(move |table, _, _| table.remove(id)).await
    }

    async fn mark_stalled(&self) -> Result<Vec<JobEntry>, JobError> {
        self.with_table(|table, settings, now| {
            Ok(table.mark_stalled(settings.visibility_timeout, now))
        })
        .await
    }

    async fn pause(&self) -> Result<(), JobError> {
        self.with_table(|table, _, _| {
            table.paused = true;
            Ok(())
        })
        .await
    }

    async fn resume(&self) -> Result<(), JobError> {
        self.with_table(|table, _, _| {
            table.paused = false;
            Ok(())
        })
        .await
    }

    async fn is_paused(&self) -> Result<bool, JobError> {
        self.with_table(|table, _, _| Ok(table.paused)).await
    }

    async fn metrics(&self) -> Result<QueueMetrics, JobError> {
        self.with_table(|table, _, now| Ok(table.metrics(now))).await
    }

    async fn clean(
        &self,
        older_than: Duration,
        limit: usize,
        state: JobState,
    ) -> Result<Vec<Uuid>, JobError> {
        self.with_table(move |table, _, now| table.clean(older_than, limit, state, now))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url() {
        let result = RedisStore::new("not a url", None, StoreSettings::default());
        assert!(matches!(result, Err(JobError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn unreachable_server_is_backend_unavailable() {
        let store = RedisStore::new("redis://127.0.0.1:1/", None, StoreSettings::default()).unwrap();
        assert!(matches!(
            store.metrics().await,
            Err(JobError::BackendUnavailable(_))
        ));
        // A failed connect leaves nothing cached; the next call tries again.
        assert!(store.conn.lock().unwrap().is_none());
        assert!(matches!(
            store.is_paused().await,
            Err(JobError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn clones_share_one_connection_slot() {
        let store = RedisStore::new("redis://127.0.0.1:1/", None, StoreSettings::default()).unwrap();
        let clone = store.clone();
        assert!(Arc::ptr_eq(&store.conn, &clone.conn));
    }
}
