use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mailsched_core::{config::MailschedConfig, DeliveryJob, HealthHandle, JobSender};
use mailsched_store::EventStore;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};

/// Name the dispatcher heartbeats under.
pub const COMPONENT: &str = "dispatcher";

/// Tunables for one dispatcher instance.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub poll_interval: Duration,
    /// Upper bound on events examined per tick.
    pub batch_size: usize,
    pub recover_claimed_on_startup: bool,
    /// A claim not renewed for this long belongs to a dead instance.
    pub claim_lease: Duration,
}

impl DispatcherSettings {
    pub fn from_config(config: &MailschedConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            batch_size: config.scheduler.batch_size.max(1),
            recover_claimed_on_startup: config.scheduler.recover_claimed_on_startup,
            claim_lease: config.claim_lease(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Pending events found due.
    pub due: usize,
    /// Claimed by this dispatcher and handed to the queue.
    pub claimed: usize,
    /// Lost to another dispatcher between scan and claim.
    pub conflicts: usize,
    /// Claims that failed with a store error.
    pub errors: usize,
}

/// Polls the event store and hands due events to the delivery workers.
///
/// Due-ness is recomputed from stored `scheduled_at` on every tick, so a
/// dispatcher holds no state worth losing. Several dispatchers may poll the
/// same store; the atomic claim decides which one dispatches an event.
pub struct Dispatcher {
    store: Arc<EventStore>,
    queue: JobSender,
    settings: DispatcherSettings,
    health: HealthHandle,
}

impl Dispatcher {
    pub fn new(
        store: Arc<EventStore>,
        queue: JobSender,
        settings: DispatcherSettings,
        health: HealthHandle,
    ) -> Self {
        Self {
            store,
            queue,
            settings,
            health,
        }
    }

    /// Main loop. Polls every `poll_interval` until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.settings.poll_interval.as_millis() as u64,
            "dispatcher started"
        );
        self.health.beat(COMPONENT);

        if self.settings.recover_claimed_on_startup {
            match self.recover_claimed().await {
                Ok(n) if n > 0 => warn!(count = n, "re-enqueued events with expired claims"),
                Err(e) => error!("claimed-event recovery failed: {e}"),
                _ => {}
            }
        }

        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.health.beat(COMPONENT);
                    // A full queue makes `tick` wait; keep shutdown responsive.
                    tokio::select! {
                        res = self.tick(Utc::now()) => match res {
                            Ok(report) if report.claimed > 0 || report.conflicts > 0 => {
                                info!(
                                    due = report.due,
                                    claimed = report.claimed,
                                    conflicts = report.conflicts,
                                    "dispatch tick"
                                );
                            }
                            Ok(_) => {}
                            Err(SchedulerError::QueueClosed) => {
                                error!("dispatch queue closed; dispatcher stopping");
                                break;
                            }
                            Err(e) => error!("dispatcher tick error: {e}"),
                        },
                        res = shutdown.changed() => {
                            if res.is_err() || *shutdown.borrow() {
                                info!("dispatcher shutting down mid-tick");
                                break;
                            }
                        }
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("dispatcher shutting down");
                        break;
                    }
                }
            }
        }
        self.health.retire(COMPONENT);
    }

    /// Claim and enqueue every event due at `now`, earliest first.
    ///
    /// A queue slot is reserved before each claim, so an event is never left
    /// `claimed` without a job on its way to a worker. While the queue is full
    /// the dispatcher keeps heartbeating.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let due = self.store.find_due(now, self.settings.batch_size)?;
        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        let beat_every = (self.health.stale_after() / 3).max(Duration::from_millis(10));

        for event in due {
            let permit = loop {
                match tokio::time::timeout(beat_every, self.queue.reserve()).await {
                    Ok(permit) => break permit.map_err(|_| SchedulerError::QueueClosed)?,
                    Err(_) => {
                        debug!(event_id = event.id, "dispatch queue full; waiting");
                        self.health.beat(COMPONENT);
                    }
                }
            };

            match self.store.claim(event.id) {
                Ok(true) => {
                    let job = DeliveryJob::new(event.id);
                    debug!(event_id = event.id, job_id = %job.job_id, "event dispatched");
                    permit.send(job);
                    report.claimed += 1;
                }
                // Another dispatcher got there first; the permit is released.
                Ok(false) => report.conflicts += 1,
                Err(e) => {
                    error!(event_id = event.id, "claim failed: {e}");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Take over and enqueue every claim whose lease has expired.
    ///
    /// Covers an instance that died between claim and terminal status. Live
    /// workers renew their claims before each send and each retry backoff, so
    /// events another running instance holds are left alone.
    pub async fn recover_claimed(&self) -> Result<usize> {
        let lease = chrono::Duration::from_std(self.settings.claim_lease)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let stale_before = Utc::now()
            .checked_sub_signed(lease)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let ids = self.store.reclaim_stale(stale_before)?;
        for id in &ids {
            let job = DeliveryJob::new(*id);
            debug!(event_id = id, job_id = %job.job_id, "re-enqueue claimed event");
            self.queue
                .send(job)
                .await
                .map_err(|_| SchedulerError::QueueClosed)?;
        }
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use mailsched_core::{dispatch_queue, EventStatus, HealthRegistry, NewEvent, Recipients};
    use rusqlite::Connection;

    use super::*;

    fn store() -> Arc<EventStore> {
        Arc::new(EventStore::new(Connection::open_in_memory().unwrap()).unwrap())
    }

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            poll_interval: Duration::from_millis(20),
            batch_size: 100,
            recover_claimed_on_startup: true,
            claim_lease: Duration::from_secs(60),
        }
    }

    fn schedule(store: &EventStore, at: DateTime<Utc>) -> i64 {
        store
            .create(&NewEvent {
                subject: "s".into(),
                content: "c".into(),
                recipients: Recipients::parse("a@x.com").unwrap(),
                scheduled_at: at,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn tick_claims_due_events_in_order() {
        let store = store();
        let now = Utc::now();
        let b = schedule(&store, now - ChronoDuration::minutes(1));
        let a = schedule(&store, now - ChronoDuration::minutes(2));
        let future = schedule(&store, now + ChronoDuration::hours(1));

        let (tx, rx) = dispatch_queue(16);
        let d = Dispatcher::new(
            Arc::clone(&store),
            tx,
            settings(),
            HealthRegistry::shared(Duration::from_secs(5)),
        );

        let report = d.tick(now).await.unwrap();
        assert_eq!(
            report,
            TickReport {
                due: 2,
                claimed: 2,
                conflicts: 0,
                errors: 0
            }
        );

        let mut rx = rx.lock().await;
        assert_eq!(rx.recv().await.unwrap().event_id, a);
        assert_eq!(rx.recv().await.unwrap().event_id, b);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.get(future).unwrap().status, EventStatus::Pending);
    }

    #[tokio::test]
    async fn second_tick_does_not_redispatch() {
        let store = store();
        schedule(&store, Utc::now() - ChronoDuration::seconds(1));
        let (tx, _rx) = dispatch_queue(16);
        let d = Dispatcher::new(
            store,
            tx,
            settings(),
            HealthRegistry::shared(Duration::from_secs(5)),
        );

        assert_eq!(d.tick(Utc::now()).await.unwrap().claimed, 1);
        assert_eq!(d.tick(Utc::now()).await.unwrap(), TickReport::default());
    }

    #[tokio::test]
    async fn competing_dispatchers_split_work_without_duplicates() {
        let store = store();
        let now = Utc::now();
        for i in 0..40 {
            schedule(&store, now - ChronoDuration::seconds(i));
        }

        let (tx, rx) = dispatch_queue(64);
        let health = HealthRegistry::shared(Duration::from_secs(5));
        let d1 = Dispatcher::new(Arc::clone(&store), tx.clone(), settings(), Arc::clone(&health));
        let d2 = Dispatcher::new(Arc::clone(&store), tx, settings(), health);

        let (r1, r2) = tokio::join!(d1.tick(now), d2.tick(now));
        let (r1, r2) = (r1.unwrap(), r2.unwrap());
        assert_eq!(r1.claimed + r2.claimed, 40);

        let mut rx = rx.lock().await;
        let mut seen = std::collections::HashSet::new();
        while let Ok(job) = rx.try_recv() {
            assert!(seen.insert(job.event_id), "event dispatched twice");
        }
        assert_eq!(seen.len(), 40);
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let store = store();
        schedule(&store, Utc::now() - ChronoDuration::seconds(1));
        let (tx, rx) = dispatch_queue(1);
        drop(rx);
        let d = Dispatcher::new(
            Arc::clone(&store),
            tx,
            settings(),
            HealthRegistry::shared(Duration::from_secs(5)),
        );
        assert!(matches!(
            d.tick(Utc::now()).await,
            Err(SchedulerError::QueueClosed)
        ));
        // Nothing was claimed without a queue slot.
        assert_eq!(store.status_counts().unwrap().pending, 1);
    }

    #[tokio::test]
    async fn recover_requeues_only_expired_claims() {
        let store = store();
        let id = schedule(&store, Utc::now());
        store.claim(id).unwrap();

        let (tx, rx) = dispatch_queue(4);
        let health = HealthRegistry::shared(Duration::from_secs(5));
        let held = Dispatcher::new(Arc::clone(&store), tx.clone(), settings(), Arc::clone(&health));
        assert_eq!(held.recover_claimed().await.unwrap(), 0);
        assert!(rx.lock().await.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let expired = Dispatcher::new(
            Arc::clone(&store),
            tx,
            DispatcherSettings {
                claim_lease: Duration::from_millis(50),
                ..settings()
            },
            health,
        );
        assert_eq!(expired.recover_claimed().await.unwrap(), 1);
        assert_eq!(rx.lock().await.recv().await.unwrap().event_id, id);
        // The takeover renewed the lease; a second pass finds nothing.
        assert_eq!(expired.recover_claimed().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn full_queue_keeps_the_dispatcher_healthy() {
        let store = store();
        let now = Utc::now();
        schedule(&store, now - ChronoDuration::seconds(2));
        schedule(&store, now - ChronoDuration::seconds(1));

        let (tx, rx) = dispatch_queue(1);
        tx.send(DeliveryJob::new(0)).await.unwrap();
        let health = HealthRegistry::shared(Duration::from_millis(60));
        health.beat(COMPONENT);
        let d = Dispatcher::new(Arc::clone(&store), tx, settings(), Arc::clone(&health));

        let tick = tokio::spawn(async move { d.tick(Utc::now()).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!tick.is_finished());
        assert!(health.is_healthy());
        assert_eq!(store.status_counts().unwrap().claimed, 0);

        // Drain so the tick can finish.
        let mut rx = rx.lock().await;
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        let report = tokio::time::timeout(Duration::from_secs(2), tick)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(report.claimed, 2);
    }

    #[tokio::test]
    async fn run_dispatches_and_stops_on_shutdown() {
        let store = store();
        let id = schedule(&store, Utc::now() - ChronoDuration::seconds(1));
        let (tx, rx) = dispatch_queue(4);
        let health = HealthRegistry::shared(Duration::from_secs(5));
        let d = Dispatcher::new(Arc::clone(&store), tx, settings(), Arc::clone(&health));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(d.run(shutdown_rx));

        let job = tokio::time::timeout(Duration::from_secs(2), async {
            rx.lock().await.recv().await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(job.event_id, id);
        assert!(health.snapshot().iter().any(|c| c.name == COMPONENT));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(health.snapshot().is_empty());
    }
}
