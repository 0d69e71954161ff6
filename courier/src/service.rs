//! The public entry point: queue emails, manage the queue, observe outcomes.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::config::CourierConfig;
use crate::error::{Error, Result};
use crate::jobs::{
    JobEntry, JobError, JobEvent, JobOpts, JobState, JobStore, MemoryStore, Priority, Queue,
    QueueMetrics, Schedule, WorkerContext, WorkerPool,
};
#[cfg(feature = "redis")]
use crate::jobs::RedisStore;
use crate::mail::{EmailData, Mailer, SmtpMailer, Throttled};
use crate::templates::{
    BookingCancellationVars, BookingConfirmationVars, EmailTemplate, NotificationVars, OtpVars,
    PasswordChangedVars, PasswordResetVars, Renderer, VerificationVars, WelcomeVars,
};

/// Transactional email delivery: a job queue, a worker pool and a template
/// renderer behind one handle.
///
/// Construct one per application and share it (it is `Send + Sync`).
/// Workers start on [`initialize`](Self::initialize) or lazily on the first
/// send, and stop on [`close`](Self::close).
///
/// ```ignore
/// let service = EmailService::in_memory(CourierConfig::load()?, SmtpMailer::from_env(5)?);
/// let job_id = service.send_otp("ada@example.com", "Ada", "123456", "10 minutes").await?;
/// let job = service.get_job_status(job_id).await?;
/// service.close().await;
/// ```
pub struct EmailService<S: JobStore = MemoryStore, M: Mailer = SmtpMailer> {
    config: CourierConfig,
    queue: Queue<S>,
    renderer: Arc<Renderer>,
    mailer: Arc<Throttled<M>>,
    pool: Mutex<Option<WorkerPool>>,
}

impl EmailService<MemoryStore, SmtpMailer> {
    /// In-memory queue and SMTP transport, both configured from the
    /// environment (`COURIER_*`, `SMTP_*`).
    pub fn from_env() -> Result<Self> {
        let config = CourierConfig::load()?;
        let mailer = SmtpMailer::from_env(config.max_connections)?;
        Ok(Self::in_memory(config, mailer))
    }
}

#[cfg(feature = "redis")]
impl EmailService<RedisStore, SmtpMailer> {
    /// Redis queue at `COURIER_REDIS_URL` and SMTP transport, both
    /// configured from the environment.
    pub fn from_env_redis() -> Result<Self> {
        let config = CourierConfig::load()?;
        let store = config
            .redis_store()?
            .ok_or_else(|| Error::Validation("COURIER_REDIS_URL is not set".into()))?;
        let mailer = SmtpMailer::from_env(config.max_connections)?;
        Ok(Self::new(config, store, mailer))
    }
}

impl<M: Mailer> EmailService<MemoryStore, M> {
    pub fn in_memory(config: CourierConfig, mailer: M) -> Self {
        let store = MemoryStore::new(config.store_settings());
        Self::new(config, store, mailer)
    }
}

impl<S: JobStore, M: Mailer> EmailService<S, M> {
    /// Built-in templates branded with `config.app_name`.
    pub fn new(config: CourierConfig, store: S, mailer: M) -> Self {
        let renderer = Renderer::new(config.app_name.clone());
        Self::with_renderer(config, store, mailer, renderer)
    }

    pub fn with_renderer(config: CourierConfig, store: S, mailer: M, renderer: Renderer) -> Self {
        let mailer = Throttled::new(
            mailer,
            config.max_connections as usize,
            config.min_send_interval(),
        );
        Self {
            queue: Queue::new(store),
            renderer: Arc::new(renderer),
            mailer: Arc::new(mailer),
            pool: Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn queue(&self) -> &Queue<S> {
        &self.queue
    }

    /// Precompile every template and start the worker pool. Calling it again
    /// while running does nothing.
    pub async fn initialize(&self) -> Result<()> {
        let mut pool = self.pool.lock().await;
        if pool.is_some() {
            return Ok(());
        }

        let compiled = self.renderer.precompile_all()?;
        let ctx = WorkerContext::new(
            self.renderer.clone(),
            self.mailer.clone(),
            self.config.from.clone(),
        );
        *pool = Some(WorkerPool::spawn(
            self.queue.clone(),
            ctx,
            self.config.worker_options(),
        ));

        tracing::info!(templates = compiled, concurrency = self.config.concurrency, "email service initialized");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.pool.lock().await.is_some()
    }

    /// Stop taking jobs and wait for in-flight ones to finish. Queued jobs
    /// stay in the store.
    pub async fn close(&self) {
        let pool = self.pool.lock().await.take();
        if let Some(pool) = pool {
            pool.shutdown_and_join().await;
            tracing::info!("email service closed");
        }
    }

    fn validate(&self, data: &EmailData) -> Result<()> {
        if data.to.is_empty() {
            return Err(Error::Validation("at least one recipient is required".into()));
        }
        if let Some(blank) = data
            .to
            .iter()
            .chain(&data.cc)
            .chain(&data.bcc)
            .find(|address| address.trim().is_empty())
        {
            return Err(Error::Validation(format!("blank recipient address: {blank:?}")));
        }
        self.renderer.compile(data.template.id())?;
        Ok(())
    }

    fn validate_opts(opts: &JobOpts) -> Result<()> {
        if let Some(delay) = opts.delay {
            let run_at = time::Duration::try_from(delay)
                .ok()
                .and_then(|delay| OffsetDateTime::now_utc().checked_add(delay));
            if run_at.is_none() {
                return Err(Error::Validation(format!("delay {delay:?} is out of range")));
            }
        }
        Ok(())
    }

    /// Queue one email. Returns as soon as the job is stored; delivery
    /// happens in the background.
    pub async fn send_email(&self, data: EmailData, opts: JobOpts) -> Result<Uuid> {
        self.validate(&data)?;
        Self::validate_opts(&opts)?;
        self.initialize().await?;

        let entry = JobEntry::new(data, &opts, self.config.max_attempts);
        let entry = self.queue.add(entry).await?;
        Ok(entry.id)
    }

    /// Queue many emails at once. Nothing is queued if any request is invalid.
    pub async fn send_bulk_emails(&self, emails: Vec<(EmailData, JobOpts)>) -> Result<Vec<Uuid>> {
        for (data, opts) in &emails {
            self.validate(data)?;
            Self::validate_opts(opts)?;
        }
        self.initialize().await?;

        let entries = emails
            .into_iter()
            .map(|(data, opts)| JobEntry::new(data, &opts, self.config.max_attempts))
            .collect();
        let entries = self.queue.add_bulk(entries).await?;
        Ok(entries.into_iter().map(|e| e.id).collect())
    }

    /// Send `data` at every occurrence of `cron` (5, 6 or 7 fields), starting
    /// with the next one.
    pub async fn schedule_email(&self, data: EmailData, cron: &str) -> Result<Uuid> {
        let schedule: Schedule = cron.parse()?;
        let now = OffsetDateTime::now_utc();
        let first = schedule
            .next_after(now)
            .ok_or_else(|| JobError::InvalidCron(format!("{cron}: never fires")))?;
        let delay = Duration::try_from(first - now).unwrap_or(Duration::ZERO);

        self.send_email(data, JobOpts::default().delay(delay).repeat(schedule))
            .await
    }

    fn to_one(to: &str, template: EmailTemplate) -> EmailData {
        EmailData::new([to], template)
    }

    fn app_name(&self) -> String {
        self.config.app_name.clone()
    }

    pub async fn send_otp(
        &self,
        to: &str,
        name: impl Into<String>,
        otp: impl Into<String>,
        expires_in: impl Into<String>,
    ) -> Result<Uuid> {
        let template = EmailTemplate::Otp(OtpVars {
            name: name.into(),
            otp: otp.into(),
            expires_in: expires_in.into(),
            app_name: self.app_name(),
        });
        self.send_email(Self::to_one(to, template), JobOpts::default().priority(Priority::High))
            .await
    }

    pub async fn send_email_verification(
        &self,
        to: &str,
        name: impl Into<String>,
        verification_link: impl Into<String>,
        expires_in: impl Into<String>,
    ) -> Result<Uuid> {
        let template = EmailTemplate::EmailVerification(VerificationVars {
            name: name.into(),
            verification_link: verification_link.into(),
            expires_in: expires_in.into(),
            app_name: self.app_name(),
        });
        self.send_email(Self::to_one(to, template), JobOpts::default().priority(Priority::High))
            .await
    }

    pub async fn send_welcome(
        &self,
        to: &str,
        name: impl Into<String>,
        dashboard_url: impl Into<String>,
    ) -> Result<Uuid> {
        let template = EmailTemplate::Welcome(WelcomeVars {
            name: name.into(),
            dashboard_url: dashboard_url.into(),
            app_name: self.app_name(),
        });
        self.send_email(Self::to_one(to, template), JobOpts::default())
            .await
    }

    pub async fn send_password_reset(
        &self,
        to: &str,
        name: impl Into<String>,
        reset_link: impl Into<String>,
        expires_in: impl Into<String>,
    ) -> Result<Uuid> {
        let template = EmailTemplate::PasswordReset(PasswordResetVars {
            name: name.into(),
            reset_link: reset_link.into(),
            expires_in: expires_in.into(),
            app_name: self.app_name(),
        });
        self.send_email(Self::to_one(to, template), JobOpts::default().priority(Priority::High))
            .await
    }

    pub async fn send_password_changed(
        &self,
        to: &str,
        name: impl Into<String>,
        changed_at: impl Into<String>,
        support_email: impl Into<String>,
    ) -> Result<Uuid> {
        let template = EmailTemplate::PasswordChanged(PasswordChangedVars {
            name: name.into(),
            changed_at: changed_at.into(),
            support_email: support_email.into(),
            app_name: self.app_name(),
        });
        self.send_email(Self::to_one(to, template), JobOpts::default())
            .await
    }

    /// An empty `app_name` is filled from the service config.
    pub async fn send_booking_confirmation(
        &self,
        to: &str,
        mut vars: BookingConfirmationVars,
    ) -> Result<Uuid> {
        if vars.app_name.is_empty() {
            vars.app_name = self.app_name();
        }
        let template = EmailTemplate::BookingConfirmation(vars);
        self.send_email(Self::to_one(to, template), JobOpts::default())
            .await
    }

    /// An empty `app_name` is filled from the service config.
    pub async fn send_booking_cancellation(
        &self,
        to: &str,
        mut vars: BookingCancellationVars,
    ) -> Result<Uuid> {
        if vars.app_name.is_empty() {
            vars.app_name = self.app_name();
        }
        let template = EmailTemplate::BookingCancellation(vars);
        self.send_email(Self::to_one(to, template), JobOpts::default())
            .await
    }

    /// An empty `app_name` is filled from the service config.
    pub async fn send_notification(&self, to: &str, mut vars: NotificationVars) -> Result<Uuid> {
        if vars.app_name.is_empty() {
            vars.app_name = self.app_name();
        }
        let template = EmailTemplate::Notification(vars);
        self.send_email(Self::to_one(to, template), JobOpts::default().priority(Priority::Low))
            .await
    }

    // ---------------------------------------------------------------------
    // Queue management
    // ---------------------------------------------------------------------

    pub async fn get_job_status(&self, id: Uuid) -> Result<JobEntry> {
        Ok(self.queue.get(id).await?.ok_or(JobError::NotFound(id))?)
    }

    /// Move a failed or stalled job back to waiting. `attempts` is kept.
    pub async fn retry_job(&self, id: Uuid) -> Result<JobEntry> {
        Ok(self.queue.retry(id).await?)
    }

    /// Delete a job that is not active. Returns false for active jobs.
    pub async fn remove_job(&self, id: Uuid) -> Result<bool> {
        Ok(self.queue.remove(id).await?)
    }

    pub async fn pause_queue(&self) -> Result<()> {
        Ok(self.queue.pause().await?)
    }

    pub async fn resume_queue(&self) -> Result<()> {
        Ok(self.queue.resume().await?)
    }

    /// Remove up to `limit` jobs (0 for all) in `state` idle for at least
    /// `older_than`.
    pub async fn clean_queue(
        &self,
        older_than: Duration,
        limit: usize,
        state: JobState,
    ) -> Result<Vec<Uuid>> {
        Ok(self.queue.clean(older_than, limit, state).await?)
    }

    pub async fn metrics(&self) -> Result<QueueMetrics> {
        Ok(self.queue.metrics().await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.queue.subscribe()
    }
}
