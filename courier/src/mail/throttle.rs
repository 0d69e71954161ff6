//! Outbound send limits shared by every worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use super::{Delivery, Email, MailError, Mailer};

/// Wraps a [`Mailer`] so that at most `max_concurrent` sends are in flight and
/// consecutive sends start at least `min_interval` apart.
///
/// The limits apply to the transport, not to workers: raising worker
/// concurrency does not raise the rate at which the provider is hit.
pub struct Throttled<M> {
    inner: M,
    permits: Arc<Semaphore>,
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl<M: Mailer> Throttled<M> {
    pub fn new(inner: M, max_concurrent: usize, min_interval: Duration) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    /// Reserve the next send slot and return when it starts.
    async fn reserve_slot(&self) -> Instant {
        let mut next = self.next_slot.lock().await;
        let now = Instant::now();
        let slot = match *next {
            Some(at) if at > now => at,
            _ => now,
        };
        *next = Some(slot + self.min_interval);
        slot
    }
}

#[async_trait]
impl<M: Mailer> Mailer for Throttled<M> {
    async fn send(&self, email: &Email) -> Result<Delivery, MailError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| MailError::Smtp("mail transport closed".into()))?;

        let slot = self.reserve_slot().await;
        if slot > Instant::now() {
            tracing::trace!(wait_ms = (slot - Instant::now()).as_millis() as u64, "send rate limited");
            tokio::time::sleep_until(slot).await;
        }

        self.inner.send(email).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct SlowMailer {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        sent_at: std::sync::Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl Mailer for SlowMailer {
        async fn send(&self, _email: &Email) -> Result<Delivery, MailError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.sent_at.lock().unwrap().push(Instant::now());
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Delivery {
                message_id: "<m@test>".into(),
            })
        }
    }

    fn email() -> Email {
        Email::builder()
            .from("a@b.com")
            .to("c@d.com")
            .subject("s")
            .text("t")
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn bounds_concurrency_and_spaces_sends() {
        let throttled = Arc::new(Throttled::new(
            SlowMailer::default(),
            2,
            Duration::from_millis(50),
        ));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let mailer = throttled.clone();
            handles.push(tokio::spawn(async move { mailer.send(&email()).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let inner = throttled.inner();
        assert!(inner.peak.load(Ordering::SeqCst) <= 2);

        let sent_at = inner.sent_at.lock().unwrap().clone();
        assert_eq!(sent_at.len(), 5);
        for pair in sent_at.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(50));
        }
    }
}
