use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::entry::{AckOutcome, JobFailure, JobState, Lease, NackOutcome};
use super::queue::Queue;
use super::traits::JobStore;
use crate::mail::{Delivery, Mailer};
use crate::templates::Renderer;

/// Everything a worker needs to turn a leased job into a sent email.
pub struct WorkerContext<M: Mailer> {
    pub renderer: Arc<Renderer>,
    pub mailer: Arc<M>,
    /// Sender used when the job does not name one.
    pub from: String,
}

impl<M: Mailer> Clone for WorkerContext<M> {
    fn clone(&self) -> Self {
        Self {
            renderer: self.renderer.clone(),
            mailer: self.mailer.clone(),
            from: self.from.clone(),
        }
    }
}

impl<M: Mailer> WorkerContext<M> {
    pub fn new(renderer: Arc<Renderer>, mailer: Arc<M>, from: impl Into<String>) -> Self {
        Self {
            renderer,
            mailer,
            from: from.into(),
        }
    }

    /// Render, compose and send one job, reporting progress along the way.
    pub async fn process<S: JobStore>(
        &self,
        queue: &Queue<S>,
        lease: &Lease,
    ) -> Result<Delivery, JobFailure> {
        let email = &lease.job.email;
        report_progress(queue, lease, 10).await;

        let rendered = self
            .renderer
            .render(&email.template)
            .map_err(|e| JobFailure::template(&e))?;
        report_progress(queue, lease, 50).await;

        let message = email
            .compose(rendered, &self.from, &lease.id().to_string())
            .map_err(|e| JobFailure::transport(&e))?;
        report_progress(queue, lease, 75).await;

        let delivery = self
            .mailer
            .send(&message)
            .await
            .map_err(|e| JobFailure::transport(&e))?;
        report_progress(queue, lease, 100).await;

        Ok(delivery)
    }
}

async fn report_progress<S: JobStore>(queue: &Queue<S>, lease: &Lease, percent: u8) {
    if let Err(e) = queue.progress(lease, percent).await {
        tracing::warn!(error = %e, percent, "failed to record progress");
    }
}

/// Tuning for a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Number of jobs processed in parallel (default: 5).
    pub concurrency: usize,
    /// How often to poll when idle (default: 1s). Backs off slightly during
    /// idle streaks.
    pub poll_interval: Duration,
    /// How often overdue leases are recovered (default: 5s).
    pub stall_check_interval: Duration,
    /// Finished jobs older than this are pruned by the maintenance task.
    pub retention: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_secs(1),
            stall_check_interval: Duration::from_secs(5),
            retention: None,
        }
    }
}

/// A fixed set of worker loops plus one maintenance loop.
///
/// ```ignore
/// let pool = WorkerPool::spawn(queue.clone(), ctx, WorkerOptions::default());
/// // ...
/// pool.shutdown_and_join().await; // in-flight jobs finish first
/// ```
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `options.concurrency` workers and the maintenance loop.
    pub fn spawn<S: JobStore, M: Mailer>(
        queue: Queue<S>,
        ctx: WorkerContext<M>,
        options: WorkerOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let concurrency = options.concurrency.max(1);
        let pool_id = uuid::Uuid::new_v4().simple().to_string();

        let mut joins = Vec::with_capacity(concurrency + 1);
        for n in 0..concurrency {
            let worker_id = format!("{}-{n}", &pool_id[..8]);
            let queue = queue.clone();
            let ctx = ctx.clone();
            let rx = shutdown_rx.clone();
            let poll_interval = options.poll_interval;
            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, queue, ctx, poll_interval, rx).await;
            }));
        }

        let rx = shutdown_rx.clone();
        let maintenance = options.clone();
        joins.push(tokio::spawn(async move {
            maintenance_loop(queue, maintenance, rx).await;
        }));

        tracing::info!(concurrency, "⏳ Worker pool running");
        Self { shutdown_tx, joins }
    }

    /// Stop taking new jobs. In-flight jobs are not cancelled.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for every worker to finish its current job.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                tracing::error!(error = %e, "worker task ended abnormally");
            }
        }
        tracing::info!("worker pool stopped");
    }
}

/// Sleep for `d` unless shutdown is requested first. Returns whether to keep
/// running.
async fn idle(rx: &mut watch::Receiver<bool>, d: Duration) -> bool {
    tokio::select! {
        changed = rx.changed() => changed.is_ok() && !*rx.borrow(),
        _ = tokio::time::sleep(d) => true,
    }
}

async fn worker_loop<S: JobStore, M: Mailer>(
    worker_id: String,
    queue: Queue<S>,
    ctx: WorkerContext<M>,
    poll_interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut idle_streak: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let lease = match queue.next(&worker_id).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                idle_streak = idle_streak.saturating_add(1);
                let backoff = poll_interval.mul_f64((1.5_f64).min(1.0 + idle_streak as f64 * 0.1));
                if !idle(&mut shutdown_rx, backoff).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                tracing::error!(%worker_id, error = %e, "failed to poll queue");
                if !idle(&mut shutdown_rx, poll_interval).await {
                    break;
                }
                continue;
            }
        };

        idle_streak = 0;
        let span = tracing::info_span!(
            "job",
            job_id = %lease.id(),
            template = %lease.job.email.template.id(),
            attempt = lease.job.attempts,
            worker = %worker_id,
        );
        run_job(&queue, &ctx, lease).instrument(span).await;
    }

    tracing::debug!(%worker_id, "worker stopped");
}

async fn run_job<S: JobStore, M: Mailer>(queue: &Queue<S>, ctx: &WorkerContext<M>, lease: Lease) {
    // Own task so a panic while sending becomes a failed attempt.
    let task = {
        let queue = queue.clone();
        let ctx = ctx.clone();
        let lease = lease.clone();
        tokio::spawn(
            async move { ctx.process(&queue, &lease).await }.instrument(tracing::Span::current()),
        )
    };

    let result = match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(JobFailure::internal("worker panicked while processing job")),
        Err(e) => Err(JobFailure::internal(format!("job task cancelled: {e}"))),
    };

    match result {
        Ok(delivery) => match queue.complete(&lease, &delivery).await {
            Ok(AckOutcome::Rescheduled { run_at }) => {
                tracing::info!(message_id = %delivery.message_id, %run_at, "email sent, next run scheduled");
            }
            Ok(AckOutcome::Completed | AckOutcome::Removed) => {
                tracing::info!(message_id = %delivery.message_id, "email sent");
            }
            Ok(outcome) => {
                tracing::warn!(message_id = %delivery.message_id, ?outcome, "email sent on a superseded lease");
            }
            Err(e) => {
                tracing::error!(error = %e, "email sent but completion was not recorded");
            }
        },
        Err(failure) => {
            let class = failure.class;
            let error_msg = failure.message.clone();
            match queue.fail(&lease, &failure).await {
                Ok(NackOutcome::Retrying { attempt, delay, .. }) => {
                    tracing::warn!(
                        ?class,
                        attempt,
                        %error_msg,
                        backoff_ms = delay.as_millis() as u64,
                        "job failed, scheduling retry"
                    );
                }
                Ok(NackOutcome::Failed) => {
                    tracing::error!(
                        ?class,
                        attempts = lease.job.attempts,
                        %error_msg,
                        "job permanently failed"
                    );
                }
                Ok(NackOutcome::Stale) => {
                    tracing::debug!(%error_msg, "failure ignored, lease superseded");
                }
                Err(e) => {
                    tracing::error!(error = %e, %error_msg, "failed to record job failure");
                }
            }
        }
    }
}

async fn maintenance_loop<S: JobStore>(
    queue: Queue<S>,
    options: WorkerOptions,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = options.stall_check_interval.max(Duration::from_millis(10));

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if let Err(e) = queue.recover_stalled().await {
            tracing::error!(error = %e, "stall check failed");
        }

        if let Some(retention) = options.retention {
            for state in [JobState::Completed, JobState::Failed] {
                if let Err(e) = queue.clean(retention, 0, state).await {
                    tracing::error!(error = %e, %state, "retention cleanup failed");
                }
            }
        }

        if !idle(&mut shutdown_rx, interval).await {
            break;
        }
    }
}
