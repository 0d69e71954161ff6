use std::collections::HashSet;
use std::time::{Duration, Instant};

use courier::jobs::{
    AckOutcome, BackoffPolicy, JobEntry, JobEvent, JobFailure, JobOpts, JobState, JobStore, Lease,
    MemoryStore, NackOutcome, Priority, Queue, Schedule, StoreSettings,
};
use courier::mail::{Delivery, EmailData};
use courier::templates::{EmailTemplate, WelcomeVars};

fn email(to: &str) -> EmailData {
    EmailData::new(
        [to],
        EmailTemplate::Welcome(WelcomeVars {
            name: "Ada".into(),
            dashboard_url: "https://playdoo.app/home".into(),
            app_name: "Playdoo".into(),
        }),
    )
}

fn job(opts: JobOpts) -> JobEntry {
    JobEntry::new(email("ada@example.com"), &opts, 3)
}

fn store_with(base: Duration, visibility: Duration) -> MemoryStore {
    MemoryStore::new(StoreSettings {
        backoff: BackoffPolicy::new(base, Duration::from_secs(60)),
        visibility_timeout: visibility,
        remove_on_complete: false,
    })
}

fn delivery(id: &str) -> Delivery {
    Delivery {
        message_id: id.to_string(),
    }
}

async fn dequeue_within(store: &MemoryStore, wait: Duration) -> Lease {
    let deadline = Instant::now() + wait;
    loop {
        if let Some(lease) = store.dequeue("w").await.unwrap() {
            return lease;
        }
        assert!(Instant::now() < deadline, "no job became ready in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_dequeue_hands_each_job_to_one_worker() {
    let store = MemoryStore::default();
    for _ in 0..50 {
        store.enqueue(job(JobOpts::default())).await.unwrap();
    }

    let mut handles = Vec::new();
    for n in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(lease) = store.dequeue(&format!("w{n}")).await.unwrap() {
                claimed.push(lease.id());
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 50);
    assert_eq!(unique.len(), 50);
    assert_eq!(store.metrics().await.unwrap().active, 50);
}

#[tokio::test]
async fn backoff_delays_grow_between_failures() {
    let store = store_with(Duration::from_millis(20), Duration::from_secs(30));
    let id = store
        .enqueue(job(JobOpts::default().max_attempts(4)))
        .await
        .unwrap()
        .id;

    let mut delays = Vec::new();
    let mut run_ats = Vec::new();
    for _ in 0..3 {
        let lease = dequeue_within(&store, Duration::from_secs(2)).await;
        match store.nack(&lease, &JobFailure::internal("smtp down")).await.unwrap() {
            NackOutcome::Retrying { delay, run_at, .. } => {
                delays.push(delay);
                run_ats.push(run_at);
            }
            other => panic!("expected a retry, got {other:?}"),
        }
        assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Delayed);
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(80)
        ]
    );
    assert!(run_ats.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn exhausted_job_stays_failed_until_retried() {
    let store = store_with(Duration::from_millis(1), Duration::from_secs(30));
    let id = store
        .enqueue(job(JobOpts::default().max_attempts(2)))
        .await
        .unwrap()
        .id;

    for _ in 0..2 {
        let lease = dequeue_within(&store, Duration::from_secs(2)).await;
        store.nack(&lease, &JobFailure::internal("boom")).await.unwrap();
    }

    let failed = store.get(id).await.unwrap().unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.attempts, 2);
    assert_eq!(failed.last_error.as_deref(), Some("boom"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(store.dequeue("w").await.unwrap().is_none());

    let requeued = store.retry(id).await.unwrap();
    assert_eq!(requeued.state, JobState::Waiting);
    assert_eq!(requeued.attempts, 2);

    let lease = store.dequeue("w").await.unwrap().unwrap();
    assert_eq!(lease.job.attempts, 3);
    assert_eq!(
        store.nack(&lease, &JobFailure::internal("boom")).await.unwrap(),
        NackOutcome::Failed
    );
}

#[tokio::test]
async fn higher_priority_wins_over_enqueue_order() {
    let store = MemoryStore::default();
    let high = store
        .enqueue(job(JobOpts::default().priority(Priority::High)))
        .await
        .unwrap()
        .id;
    let critical = store
        .enqueue(job(JobOpts::default().priority(Priority::Critical)))
        .await
        .unwrap()
        .id;

    assert_eq!(store.dequeue("w").await.unwrap().unwrap().id(), critical);
    assert_eq!(store.dequeue("w").await.unwrap().unwrap().id(), high);
}

#[tokio::test]
async fn email_priority_applies_without_explicit_option() {
    let store = MemoryStore::default();
    store.enqueue(job(JobOpts::default())).await.unwrap();
    let urgent = JobEntry::new(
        email("ops@example.com").priority(Priority::Critical),
        &JobOpts::default(),
        3,
    );
    let urgent = store.enqueue(urgent).await.unwrap().id;

    assert_eq!(store.dequeue("w").await.unwrap().unwrap().id(), urgent);
}

#[tokio::test]
async fn second_ack_changes_nothing() {
    let store = MemoryStore::default();
    let id = store.enqueue(job(JobOpts::default())).await.unwrap().id;
    let lease = store.dequeue("w").await.unwrap().unwrap();

    assert_eq!(
        store.ack(&lease, &delivery("<one@test>")).await.unwrap(),
        AckOutcome::Completed
    );
    let first = store.get(id).await.unwrap().unwrap();

    assert_eq!(
        store.ack(&lease, &delivery("<two@test>")).await.unwrap(),
        AckOutcome::AlreadyCompleted
    );
    let second = store.get(id).await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(second.state, JobState::Completed);
    assert_eq!(second.result.unwrap().message_id(), Some("<one@test>"));
}

#[tokio::test]
async fn stalled_job_is_redelivered_once() {
    let store = store_with(Duration::from_millis(10), Duration::from_millis(30));
    let queue = Queue::new(store.clone());
    let mut events = queue.subscribe();
    let id = queue.add(job(JobOpts::default())).await.unwrap().id;

    let abandoned = queue.next("crashed").await.unwrap().unwrap();
    assert_eq!(abandoned.job.attempts, 1);

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(queue.recover_stalled().await.unwrap(), 1);

    let recovered = store.get(id).await.unwrap().unwrap();
    assert_eq!(recovered.state, JobState::Waiting);
    assert_eq!(recovered.stalls, 1);

    let lease = queue.next("healthy").await.unwrap().unwrap();
    assert_eq!(lease.job.attempts, 2);
    assert_eq!(
        queue.complete(&lease, &delivery("<ok@test>")).await.unwrap(),
        AckOutcome::Completed
    );

    // The slow worker finishing late is harmless.
    assert_eq!(
        queue.complete(&abandoned, &delivery("<late@test>")).await.unwrap(),
        AckOutcome::AlreadyCompleted
    );

    let done = store.get(id).await.unwrap().unwrap();
    assert_eq!(done.attempts, 2);
    assert_eq!(done.result.unwrap().message_id(), Some("<ok@test>"));

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec![
            "job:queued",
            "job:active",
            "job:stalled",
            "job:waiting",
            "job:active",
            "job:completed"
        ]
    );
}

#[tokio::test]
async fn stall_on_last_attempt_fails_the_job() {
    let store = store_with(Duration::from_millis(10), Duration::from_millis(10));
    let queue = Queue::new(store.clone());
    let id = queue
        .add(job(JobOpts::default().max_attempts(1)))
        .await
        .unwrap()
        .id;

    queue.next("crashed").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    queue.recover_stalled().await.unwrap();

    assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Failed);
    assert!(queue.next("w").await.unwrap().is_none());
}

#[tokio::test]
async fn late_ack_after_final_stall_keeps_the_job_failed() {
    let store = store_with(Duration::from_millis(10), Duration::from_millis(10));
    let queue = Queue::new(store.clone());
    let mut events = queue.subscribe();
    let id = queue
        .add(job(JobOpts::default().max_attempts(1)))
        .await
        .unwrap()
        .id;

    let slow = queue.next("slow").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(queue.recover_stalled().await.unwrap(), 1);

    assert_eq!(
        queue.complete(&slow, &delivery("<late@test>")).await.unwrap(),
        AckOutcome::Stale
    );
    let failed = store.get(id).await.unwrap().unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert!(failed.finished_at.is_some());

    let names: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e| e.name())
        .collect();
    assert_eq!(names, vec!["job:queued", "job:active", "job:stalled", "job:failed"]);
}

#[tokio::test]
async fn pause_holds_jobs_without_dropping_them() {
    let store = MemoryStore::default();
    let queue = Queue::new(store.clone());
    let mut events = queue.subscribe();
    queue.add(job(JobOpts::default())).await.unwrap();

    queue.pause().await.unwrap();
    assert!(queue.is_paused().await.unwrap());
    assert!(queue.next("w").await.unwrap().is_none());
    let metrics = queue.metrics().await.unwrap();
    assert_eq!((metrics.waiting, metrics.paused), (0, 1));

    queue.resume().await.unwrap();
    assert!(queue.next("w").await.unwrap().is_some());

    let names: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|e| e.name())
        .collect();
    assert_eq!(names, vec!["job:queued", "queue:paused", "queue:resumed", "job:active"]);
}

#[tokio::test]
async fn remove_skips_active_jobs() {
    let store = MemoryStore::default();
    let queue = Queue::new(store.clone());
    let delayed = queue
        .add(job(JobOpts::default().delay(Duration::from_secs(60))))
        .await
        .unwrap()
        .id;
    let active = queue.add(job(JobOpts::default())).await.unwrap().id;
    queue.next("w").await.unwrap().unwrap();

    assert!(!queue.remove(active).await.unwrap());
    assert_eq!(store.get(active).await.unwrap().unwrap().state, JobState::Active);

    assert!(queue.remove(delayed).await.unwrap());
    assert!(store.get(delayed).await.unwrap().is_none());
    assert!(matches!(
        queue.remove(delayed).await,
        Err(courier::jobs::JobError::NotFound(_))
    ));
}

#[tokio::test]
async fn delayed_jobs_wait_for_their_time() {
    let store = MemoryStore::default();
    store
        .enqueue(job(JobOpts::default().delay(Duration::from_millis(40))))
        .await
        .unwrap();

    assert!(store.dequeue("w").await.unwrap().is_none());
    assert_eq!(store.metrics().await.unwrap().delayed, 1);

    let lease = dequeue_within(&store, Duration::from_secs(2)).await;
    assert_eq!(lease.job.attempts, 1);
}

#[tokio::test]
async fn recurring_job_is_rescheduled_after_each_send() {
    let store = MemoryStore::default();
    let queue = Queue::new(store.clone());
    let mut events = queue.subscribe();
    let every_second: Schedule = "* * * * * *".parse().unwrap();
    let id = queue
        .add(job(JobOpts::default().repeat(every_second)))
        .await
        .unwrap()
        .id;

    let lease = queue.next("w").await.unwrap().unwrap();
    let outcome = queue.complete(&lease, &delivery("<r1@test>")).await.unwrap();
    assert!(matches!(outcome, AckOutcome::Rescheduled { .. }));

    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.state, JobState::Delayed);
    assert_eq!(entry.attempts, 0);

    let rescheduled = std::iter::from_fn(|| events.try_recv().ok())
        .any(|e| matches!(e, JobEvent::Rescheduled { id: job_id, .. } if job_id == id));
    assert!(rescheduled);
}

#[tokio::test]
async fn remove_on_complete_drops_finished_jobs() {
    let store = MemoryStore::new(StoreSettings {
        remove_on_complete: true,
        ..Default::default()
    });
    let id = store.enqueue(job(JobOpts::default())).await.unwrap().id;
    let lease = store.dequeue("w").await.unwrap().unwrap();

    assert_eq!(
        store.ack(&lease, &delivery("<m@test>")).await.unwrap(),
        AckOutcome::Removed
    );
    assert!(store.get(id).await.unwrap().is_none());
}

#[tokio::test]
async fn clean_prunes_old_terminal_jobs() {
    let store = MemoryStore::default();
    let queue = Queue::new(store.clone());
    for _ in 0..3 {
        queue.add(job(JobOpts::default())).await.unwrap();
        let lease = queue.next("w").await.unwrap().unwrap();
        queue.complete(&lease, &delivery("<m@test>")).await.unwrap();
    }
    queue.add(job(JobOpts::default())).await.unwrap();

    let removed = queue
        .clean(Duration::ZERO, 2, JobState::Completed)
        .await
        .unwrap();
    assert_eq!(removed.len(), 2);

    let metrics = queue.metrics().await.unwrap();
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.waiting, 1);
    assert!(queue.clean(Duration::ZERO, 0, JobState::Active).await.is_err());
}

#[tokio::test]
async fn clean_with_enormous_age_is_a_no_op() {
    let store = MemoryStore::default();
    let queue = Queue::new(store.clone());
    queue.add(job(JobOpts::default())).await.unwrap();
    let lease = queue.next("w").await.unwrap().unwrap();
    queue.complete(&lease, &delivery("<m@test>")).await.unwrap();

    let removed = queue
        .clean(Duration::MAX, 0, JobState::Completed)
        .await
        .unwrap();
    assert!(removed.is_empty());
    assert_eq!(queue.metrics().await.unwrap().completed, 1);
}

#[tokio::test]
async fn enormous_delay_is_clamped() {
    let store = MemoryStore::default();
    let entry = store
        .enqueue(job(JobOpts::default().delay(Duration::MAX)))
        .await
        .unwrap();

    assert_eq!(entry.state, JobState::Delayed);
    assert!(store.dequeue("w").await.unwrap().is_none());
}
