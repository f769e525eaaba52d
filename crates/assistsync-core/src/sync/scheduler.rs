//! Background scheduler.
//!
//! Runs reconciliations as spawned tasks so that a caller giving up on its
//! wait never cancels the work. At most one reconciliation per key is in
//! flight; concurrent requests join it and receive the same outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::engine::{ReconcileOutcome, SyncEngine};
use super::SyncError;

type Flight = watch::Receiver<Option<ReconcileOutcome>>;

/// Smallest sweep period the scheduler runs with
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct InFlight {
    rx: Flight,
    task: AbortHandle,
}

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    /// Retry timers already armed, by key
    armed: Mutex<HashMap<String, Instant>>,
    shutdown: watch::Sender<bool>,
}

/// Resolves once shutdown has been signalled.
async fn stopped(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            in_flight: Mutex::new(HashMap::new()),
            armed: Mutex::new(HashMap::new()),
            shutdown: watch::channel(false).0,
        })
    }

    fn flights(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn armed(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.armed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn in_flight(&self) -> usize {
        self.flights().len()
    }

    /// Reconcile `key` and wait for the outcome, joining a running
    /// reconciliation if there is one. Dropping the returned future only
    /// stops the wait.
    pub async fn request(self: &Arc<Self>, key: &str, forced: bool) -> ReconcileOutcome {
        let Some(mut flight) = self.join_or_start(key, forced) else {
            return ReconcileOutcome::Failed(SyncError::ShuttingDown);
        };
        match flight.wait_for(Option::is_some).await.map(|o| (*o).clone()) {
            Ok(Some(outcome)) => outcome,
            _ => ReconcileOutcome::Failed(SyncError::Transient(
                "reconciliation aborted".to_string(),
            )),
        }
    }

    /// Start a reconciliation for `key` unless one is already running.
    /// `None` after shutdown.
    pub fn join_or_start(self: &Arc<Self>, key: &str, forced: bool) -> Option<Flight> {
        if self.is_shut_down() {
            return None;
        }

        let mut flights = self.flights();
        if let Some(flight) = flights.get(key) {
            // A closed channel means the task died without reporting
            if flight.rx.has_changed().is_ok() {
                debug!(key, "Joining in-flight reconciliation");
                return Some(flight.rx.clone());
            }
        }

        let (tx, rx) = watch::channel(None);
        let this = Arc::clone(self);
        let owned_key = key.to_string();
        let ours = rx.clone();
        let task = tokio::spawn(async move {
            let key = owned_key;
            let outcome = this.engine.reconcile(&key, forced).await;
            {
                let mut flights = this.flights();
                if flights.get(&key).is_some_and(|f| f.rx.same_channel(&ours)) {
                    flights.remove(&key);
                }
            }
            debug!(key, ?outcome, "Reconciliation finished");
            this.after_flight(&key, &outcome);
            let _ = tx.send(Some(outcome));
        });
        flights.insert(
            key.to_string(),
            InFlight {
                rx: rx.clone(),
                task: task.abort_handle(),
            },
        );
        Some(rx)
    }

    /// Follow up on a finished reconciliation: arm the retry timer of a key
    /// that is backing off, or run again when writes were queued while the
    /// flight was pulling.
    fn after_flight(self: &Arc<Self>, key: &str, outcome: &ReconcileOutcome) {
        if let Some(at) = self.engine.retry_at(key) {
            self.arm_retry(key, at);
            return;
        }
        if !matches!(outcome, ReconcileOutcome::Applied { .. } | ReconcileOutcome::Conflict) {
            return;
        }
        match self.engine.pending(key) {
            Ok(queue) if !queue.is_empty() => {
                debug!(key, queued = queue.len(), "Writes queued during reconciliation");
                self.join_or_start(key, false);
            }
            Ok(_) => {}
            Err(e) => warn!(key, error = %e, "Could not read mutation queue"),
        }
    }

    /// Re-request `key` once its backoff elapses.
    fn arm_retry(self: &Arc<Self>, key: &str, at: Instant) {
        {
            let mut armed = self.armed();
            if armed.get(key) == Some(&at) {
                return;
            }
            armed.insert(key.to_string(), at);
        }

        let this = Arc::clone(self);
        let key = key.to_string();
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(at) => {}
                _ = stopped(shutdown) => return,
            }
            {
                let mut armed = this.armed();
                if armed.get(&key) == Some(&at) {
                    armed.remove(&key);
                }
            }
            debug!(key, "Retry timer fired");
            this.join_or_start(&key, false);
        });
    }

    /// Request every key that has queued writes or a stale snapshot.
    async fn sweep(self: &Arc<Self>) {
        let engine = Arc::clone(&self.engine);
        let keys = match tokio::task::spawn_blocking(move || engine.sweep_candidates()).await {
            Ok(Ok(keys)) => keys,
            Ok(Err(e)) => {
                warn!(error = %e, "Sweep could not read local store");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Sweep task failed");
                return;
            }
        };
        if !keys.is_empty() {
            debug!(count = keys.len(), "Sweep requesting reconciliation");
        }
        for key in keys {
            self.join_or_start(&key, false);
        }
    }

    /// Drive periodic sweeps and mutation wake-ups until shutdown.
    pub async fn run(self: Arc<Self>, mut nudges: mpsc::UnboundedReceiver<String>, sweep_interval: Duration) {
        let period = if sweep_interval < MIN_SWEEP_INTERVAL {
            warn!(
                sweep_secs = sweep_interval.as_secs_f64(),
                "Sweep interval too short, using {}s",
                MIN_SWEEP_INTERVAL.as_secs()
            );
            MIN_SWEEP_INTERVAL
        } else {
            sweep_interval
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let stop = stopped(self.shutdown.subscribe());
        tokio::pin!(stop);
        info!(sweep_secs = period.as_secs_f64(), "Sync scheduler started");

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => self.sweep().await,
                Some(key) = nudges.recv() => {
                    self.join_or_start(&key, false);
                }
            }
        }
        info!("Sync scheduler stopped");
    }

    /// Stop the sweeps and retry timers without waiting.
    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop scheduling new work and give in-flight reconciliations up to
    /// `grace` to finish; whatever is still running after that is aborted.
    /// Nothing is lost: mutations are only removed from the durable queue
    /// after the server acknowledged them.
    pub async fn shutdown(&self, grace: Duration) {
        self.signal_shutdown();
        let flights: Vec<Flight> = self.flights().values().map(|f| f.rx.clone()).collect();
        if flights.is_empty() {
            return;
        }

        let wait = futures::future::join_all(flights.into_iter().map(|mut flight| async move {
            let _ = flight.wait_for(Option::is_some).await;
        }));
        if tokio::time::timeout(grace, wait).await.is_err() {
            let abandoned: Vec<InFlight> = self.flights().drain().map(|(_, f)| f).collect();
            warn!(
                count = abandoned.len(),
                "Shutdown grace elapsed; aborting reconciliations, their writes stay queued"
            );
            for flight in abandoned {
                flight.task.abort();
            }
        }
    }
}
