use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mailsched_core::{DeliveryJob, EventId, EventStatus, HealthHandle, JobSender, SharedJobReceiver};
use mailsched_store::{EventStore, StoreError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::transport::{MailTransport, OutgoingMail, TransportError};

/// Health name prefix; workers register as `delivery-worker-<n>`.
pub const COMPONENT_PREFIX: &str = "delivery-worker";

/// What happened to one delivery job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The event was gone or no longer `claimed`; nothing was sent.
    Discarded,
    Delivered,
    /// Transient failure; the job comes back after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Terminal failure; the event is now `failed`.
    Failed { reason: String },
}

/// Carries a claimed event through one transport attempt.
#[derive(Clone)]
pub struct DeliveryWorker {
    store: Arc<EventStore>,
    transport: Arc<dyn MailTransport>,
    policy: RetryPolicy,
    send_timeout: Duration,
    requeue: JobSender,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<EventStore>,
        transport: Arc<dyn MailTransport>,
        policy: RetryPolicy,
        send_timeout: Duration,
        requeue: JobSender,
    ) -> Self {
        Self {
            store,
            transport,
            policy,
            send_timeout,
            requeue,
        }
    }

    /// Process one job to completion.
    ///
    /// Only store errors are returned; transport failures are recorded on
    /// the event and reported through the [`Outcome`]. Recording the attempt
    /// and the error both renew the claim lease, so a live worker keeps its
    /// event for the send and the retry backoff that follows.
    #[instrument(skip(self, job), fields(event_id = job.event_id, job_id = %job.job_id))]
    pub async fn process(&self, job: &DeliveryJob) -> Result<Outcome> {
        let event = match self.store.get(job.event_id) {
            Ok(event) => event,
            Err(StoreError::NotFound { .. }) => {
                debug!("event not found; job discarded");
                return Ok(Outcome::Discarded);
            }
            Err(e) => return Err(e.into()),
        };

        if event.status != EventStatus::Claimed {
            debug!(status = %event.status, "event not claimed; job discarded");
            return Ok(Outcome::Discarded);
        }

        if self.policy.exhausted(event.attempt_count) {
            let reason = format!(
                "attempt budget of {} used up before send",
                self.policy.max_attempts
            );
            return self.fail(event.id, reason);
        }

        let attempt = self.store.record_attempt(event.id)?;
        let mail = OutgoingMail::render(&event);

        let sent = match tokio::time::timeout(self.send_timeout, self.transport.send(&mail)).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Transient(format!(
                "send timed out after {}s",
                self.send_timeout.as_secs_f32()
            ))),
        };

        match sent {
            Ok(()) => {
                self.store.mark_done(event.id, Utc::now())?;
                info!(
                    attempt,
                    recipients = mail.to.len(),
                    transport = self.transport.name(),
                    "email delivered"
                );
                Ok(Outcome::Delivered)
            }
            Err(err) => {
                self.store.record_error(event.id, &err.to_string())?;
                if err.is_permanent() {
                    return self.fail(event.id, format!("attempt {attempt}: {err}"));
                }
                if self.policy.exhausted(attempt) {
                    return self.fail(
                        event.id,
                        format!("gave up after {attempt} attempts: {err}"),
                    );
                }
                let delay = self.policy.delay_for(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "delivery attempt failed, will retry: {err}"
                );
                self.schedule_retry(event.id, delay);
                Ok(Outcome::Retrying { attempt, delay })
            }
        }
    }

    fn fail(&self, id: EventId, reason: String) -> Result<Outcome> {
        self.store.mark_failed(id, &reason)?;
        error!(reason = %reason, "delivery failed");
        Ok(Outcome::Failed { reason })
    }

    fn schedule_retry(&self, event_id: EventId, delay: Duration) {
        let tx = self.requeue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(DeliveryJob::new(event_id)).await.is_err() {
                warn!(
                    event_id,
                    "dispatch queue closed before retry; event stays claimed until recovery"
                );
            }
        });
    }
}

/// A fixed set of workers draining the shared dispatch queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `n` workers. Each takes one job at a time and finishes it before
    /// taking the next; in-flight jobs complete after `shutdown` fires.
    pub fn spawn(
        n: usize,
        worker: DeliveryWorker,
        jobs: SharedJobReceiver,
        health: HealthHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handles = (0..n.max(1))
            .map(|i| {
                tokio::spawn(worker_loop(
                    format!("{COMPONENT_PREFIX}-{i}"),
                    worker.clone(),
                    Arc::clone(&jobs),
                    Arc::clone(&health),
                    shutdown.clone(),
                ))
            })
            .collect();
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("delivery worker panicked: {e}");
            }
        }
    }
}

async fn worker_loop(
    name: String,
    worker: DeliveryWorker,
    jobs: SharedJobReceiver,
    health: HealthHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    // Beat while idle so a quiet queue does not look like a dead worker.
    let idle_beat = (health.stale_after() / 3).max(Duration::from_millis(10));
    health.beat(&name);
    info!(worker = %name, "delivery worker started");

    loop {
        let next = tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            next = tokio::time::timeout(idle_beat, async { jobs.lock().await.recv().await }) => next,
        };
        health.beat(&name);

        let job = match next {
            Err(_) => continue,
            Ok(None) => {
                info!(worker = %name, "dispatch queue closed");
                break;
            }
            Ok(Some(job)) => job,
        };

        match worker.process(&job).await {
            Ok(outcome) => debug!(worker = %name, event_id = job.event_id, ?outcome, "job finished"),
            Err(e) => error!(worker = %name, event_id = job.event_id, "delivery job error: {e}"),
        }
        health.beat(&name);
    }

    info!(worker = %name, "delivery worker stopped");
    health.retire(&name);
}
