use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::backoff::BackoffPolicy;
use super::scheduler::Schedule;
use crate::mail::{Delivery, EmailData, MailError};
use crate::templates::TemplateError;

/// State of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be dequeued.
    Waiting,
    /// Not eligible before `run_at` (send later, backoff, next recurrence).
    Delayed,
    /// Held by exactly one worker.
    Active,
    Completed,
    /// Terminal; only a manual retry moves it again.
    Failed,
    /// Lease expired while active; transient until requeued.
    Stalled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        Self::Waiting,
        Self::Delayed,
        Self::Active,
        Self::Completed,
        Self::Failed,
        Self::Stalled,
    ];

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stalled => "stalled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for JobState {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

/// Dequeue preference among ready jobs; higher goes first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Options controlling retry, scheduling and recurrence for a job.
#[derive(Debug, Clone, Default)]
pub struct JobOpts {
    /// Maximum number of attempts (including the first). Falls back to the
    /// service default.
    pub max_attempts: Option<u32>,
    /// Delay before the job becomes eligible for processing.
    pub delay: Option<Duration>,
    /// Overrides the priority carried by the email itself.
    pub priority: Option<Priority>,
    /// Re-run the job at every occurrence of this schedule.
    pub repeat: Option<Schedule>,
}

impl JobOpts {
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn repeat(mut self, schedule: Schedule) -> Self {
        self.repeat = Some(schedule);
        self
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Template,
    Transport,
    Stalled,
    Internal,
}

/// A failed attempt as reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub class: FailureClass,
    pub message: String,
    /// False when repeating the attempt would fail the same way.
    pub retryable: bool,
}

impl JobFailure {
    pub fn template(err: &TemplateError) -> Self {
        Self {
            class: FailureClass::Template,
            message: err.to_string(),
            retryable: false,
        }
    }

    pub fn transport(err: &MailError) -> Self {
        Self {
            class: FailureClass::Transport,
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Internal,
            message: message.into(),
            retryable: true,
        }
    }
}

/// Last recorded outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobResult {
    Sent {
        message_id: String,
        sent_at: OffsetDateTime,
    },
    Failed {
        class: FailureClass,
        message: String,
        failed_at: OffsetDateTime,
    },
}

impl JobResult {
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Sent { message_id, .. } => Some(message_id),
            Self::Failed { .. } => None,
        }
    }
}

/// Result of acknowledging a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Completed,
    /// Recurring job moved to its next occurrence.
    Rescheduled { run_at: OffsetDateTime },
    /// Completed and dropped (`remove_on_complete`).
    Removed,
    /// A second ack for a finished job; nothing changed.
    AlreadyCompleted,
    /// The lease was superseded; nothing changed.
    Stale,
}

/// Result of reporting a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    Retrying {
        attempt: u32,
        delay: Duration,
        run_at: OffsetDateTime,
    },
    Failed,
    Stale,
}

/// A job handed to one worker. The token identifies this activation.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: JobEntry,
    pub token: Uuid,
    pub worker: String,
}

impl Lease {
    pub fn id(&self) -> Uuid {
        self.job.id
    }
}

/// Serialized representation of a queued job.
///
/// This is the unit of work stored in any queue backend. The transition
/// methods below are the whole state machine; backends only add atomicity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: Uuid,
    pub email: EmailData,
    pub priority: Priority,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Extra attempts granted by manual retries of exhausted jobs.
    pub manual_retries: u32,
    pub stalls: u32,
    /// Enqueue order, for FIFO within a priority.
    pub seq: u64,
    pub run_at: OffsetDateTime,
    pub repeat: Option<Schedule>,
    pub progress: u8,
    pub lease: Option<Uuid>,
    pub locked_by: Option<String>,
    pub locked_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub result: Option<JobResult>,
    pub created_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
}

impl JobEntry {
    /// Build a new entry. `default_max_attempts` applies when `opts` has none.
    pub fn new(email: EmailData, opts: &JobOpts, default_max_attempts: u32) -> Self {
        let now = OffsetDateTime::now_utc();
        let run_at = match (opts.delay, email.send_at) {
            (Some(delay), _) => saturating_after(now, delay),
            (None, Some(at)) if at > now => at,
            _ => now,
        };
        let priority = opts.priority.or(email.priority).unwrap_or_default();

        Self {
            id: Uuid::new_v4(),
            email,
            priority,
            state: if run_at > now {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            attempts: 0,
            max_attempts: opts.max_attempts.unwrap_or(default_max_attempts).max(1),
            manual_retries: 0,
            stalls: 0,
            seq: 0,
            run_at,
            repeat: opts.repeat.clone(),
            progress: 0,
            lease: None,
            locked_by: None,
            locked_at: None,
            last_error: None,
            result: None,
            created_at: now,
            finished_at: None,
        }
    }

    /// Attempts this job may make in total.
    pub fn attempt_budget(&self) -> u32 {
        self.max_attempts + self.manual_retries
    }

    /// Eligible for dequeue at `now`.
    pub fn is_ready(&self, now: OffsetDateTime) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed)
            && self.run_at <= now
            && self.attempts < self.attempt_budget()
    }

    /// Active, and the lease is older than the visibility window.
    pub fn is_lease_expired(&self, visibility: Duration, now: OffsetDateTime) -> bool {
        self.state == JobState::Active
            && self
                .locked_at
                .is_some_and(|at| saturating_after(at, visibility) <= now)
    }

    pub(crate) fn activate(&mut self, worker: &str, now: OffsetDateTime) -> Uuid {
        let token = Uuid::new_v4();
        self.state = JobState::Active;
        self.attempts += 1;
        self.progress = 0;
        self.lease = Some(token);
        self.locked_by = Some(worker.to_string());
        self.locked_at = Some(now);
        token
    }

    fn release(&mut self) {
        self.lease = None;
        self.locked_by = None;
        self.locked_at = None;
    }

    pub(crate) fn ack(&mut self, token: Uuid, delivery: &Delivery, now: OffsetDateTime) -> AckOutcome {
        if self.state == JobState::Completed {
            return AckOutcome::AlreadyCompleted;
        }
        if self.lease != Some(token) {
            return AckOutcome::Stale;
        }

        self.release();
        self.progress = 100;
        self.last_error = None;
        self.result = Some(JobResult::Sent {
            message_id: delivery.message_id.clone(),
            sent_at: now,
        });

        if let Some(next) = self.repeat.as_ref().and_then(|s| s.next_after(now)) {
            self.state = JobState::Delayed;
            self.run_at = next;
            self.attempts = 0;
            self.manual_retries = 0;
            return AckOutcome::Rescheduled { run_at: next };
        }

        self.state = JobState::Completed;
        self.finished_at = Some(now);
        AckOutcome::Completed
    }

    pub(crate) fn nack(
        &mut self,
        token: Uuid,
        failure: &JobFailure,
        backoff: &BackoffPolicy,
        now: OffsetDateTime,
    ) -> NackOutcome {
        if self.state != JobState::Active || self.lease != Some(token) {
            return NackOutcome::Stale;
        }

        self.release();
        self.last_error = Some(failure.message.clone());
        self.result = Some(JobResult::Failed {
            class: failure.class,
            message: failure.message.clone(),
            failed_at: now,
        });

        if failure.retryable && self.attempts < self.attempt_budget() {
            let delay = backoff.delay_for(self.attempts);
            self.state = JobState::Delayed;
            self.run_at = saturating_after(now, delay);
            NackOutcome::Retrying {
                attempt: self.attempts,
                delay,
                run_at: self.run_at,
            }
        } else {
            self.state = JobState::Failed;
            self.finished_at = Some(now);
            NackOutcome::Failed
        }
    }

    /// Expire the lease. While attempts remain, the token is kept so the
    /// original worker can still ack if it was only slow. A job failed by its
    /// last stall drops the token, so it stays failed until retried.
    pub(crate) fn stall(&mut self, now: OffsetDateTime) {
        self.stalls += 1;
        self.locked_by = None;
        self.locked_at = None;

        if self.attempts >= self.attempt_budget() {
            self.lease = None;
            let message = "job stalled more than allowable limit".to_string();
            self.state = JobState::Failed;
            self.finished_at = Some(now);
            self.last_error = Some(message.clone());
            self.result = Some(JobResult::Failed {
                class: FailureClass::Stalled,
                message,
                failed_at: now,
            });
        } else {
            self.state = JobState::Stalled;
        }
    }

    /// Move a failed or stalled job back to waiting. `attempts` is kept; an
    /// exhausted job is granted exactly one more attempt.
    pub(crate) fn requeue(&mut self, now: OffsetDateTime) -> Result<(), JobState> {
        match self.state {
            JobState::Stalled => {}
            JobState::Failed => {
                if self.attempts >= self.attempt_budget() {
                    self.manual_retries += 1;
                }
                self.finished_at = None;
            }
            other => return Err(other),
        }
        self.state = JobState::Waiting;
        self.run_at = now;
        self.progress = 0;
        Ok(())
    }
}

/// `at + delay`, clamped to the latest representable instant.
pub(crate) fn saturating_after(at: OffsetDateTime, delay: Duration) -> OffsetDateTime {
    time::Duration::try_from(delay)
        .ok()
        .and_then(|delay| at.checked_add(delay))
        .unwrap_or_else(|| at.saturating_add(time::Duration::MAX))
}
