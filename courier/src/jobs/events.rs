//! Lifecycle events and queue counters.

use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::entry::{FailureClass, JobState};

/// Something that happened to a job or to the queue.
///
/// Every job event carries the job id so observers can correlate them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Queued {
        id: Uuid,
        state: JobState,
    },
    Active {
        id: Uuid,
        attempt: u32,
        worker: String,
    },
    Progress {
        id: Uuid,
        percent: u8,
    },
    Completed {
        id: Uuid,
        message_id: String,
    },
    /// A recurring job finished one run and was scheduled again.
    Rescheduled {
        id: Uuid,
        message_id: String,
        run_at: OffsetDateTime,
    },
    Retrying {
        id: Uuid,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Failed {
        id: Uuid,
        class: FailureClass,
        error: String,
        attempts: u32,
    },
    Stalled {
        id: Uuid,
        stalls: u32,
    },
    /// Back in the ready set after a stall or a manual retry.
    Waiting {
        id: Uuid,
    },
    Removed {
        id: Uuid,
    },
    Paused,
    Resumed,
    Cleaned {
        state: JobState,
        count: usize,
    },
}

impl JobEvent {
    /// Stable event name, e.g. `job:completed`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "job:queued",
            Self::Active { .. } => "job:active",
            Self::Progress { .. } => "job:progress",
            Self::Completed { .. } => "job:completed",
            Self::Rescheduled { .. } => "job:rescheduled",
            Self::Retrying { .. } => "job:retrying",
            Self::Failed { .. } => "job:failed",
            Self::Stalled { .. } => "job:stalled",
            Self::Waiting { .. } => "job:waiting",
            Self::Removed { .. } => "job:removed",
            Self::Paused => "queue:paused",
            Self::Resumed => "queue:resumed",
            Self::Cleaned { .. } => "queue:cleaned",
        }
    }

    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Self::Queued { id, .. }
            | Self::Active { id, .. }
            | Self::Progress { id, .. }
            | Self::Completed { id, .. }
            | Self::Rescheduled { id, .. }
            | Self::Retrying { id, .. }
            | Self::Failed { id, .. }
            | Self::Stalled { id, .. }
            | Self::Waiting { id }
            | Self::Removed { id } => Some(*id),
            Self::Paused | Self::Resumed | Self::Cleaned { .. } => None,
        }
    }
}

/// Fan-out of [`JobEvent`]s to any number of subscribers.
///
/// Publishing never blocks; a subscriber that falls more than `capacity`
/// events behind skips the oldest ones.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: JobEvent) {
        tracing::trace!(event = event.name(), job_id = ?event.job_id(), "job event");
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

/// Point-in-time job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    /// Ready jobs held back because the queue is paused.
    pub paused: usize,
}

impl QueueMetrics {
    pub fn total(&self) -> usize {
        self.waiting + self.active + self.completed + self.failed + self.delayed + self.paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        bus.publish(JobEvent::Waiting { id });
        bus.publish(JobEvent::Paused);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name(), "job:waiting");
        assert_eq!(first.job_id(), Some(id));
        assert_eq!(rx.recv().await.unwrap(), JobEvent::Paused);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        EventBus::default().publish(JobEvent::Resumed);
    }

    #[test]
    fn serializes_with_event_tag() {
        let json = serde_json::to_value(JobEvent::Stalled {
            id: Uuid::nil(),
            stalls: 1,
        })
        .unwrap();
        assert_eq!(json["event"], "stalled");
        assert_eq!(json["stalls"], 1);
    }
}
