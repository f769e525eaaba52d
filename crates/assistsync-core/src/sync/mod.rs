//! Sync engine and its consumer-facing handle.
//!
//! - `engine`: reconciliation of one key (push queue, pull, conflicts)
//! - `scheduler`: single-flight, periodic sweeps, retry timers
//! - `backoff`: retry delay schedule
//!
//! Consumers only hold a `SyncHandle`.

pub mod backoff;
pub mod engine;
pub mod error;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::RemoteApi;
use crate::cache::{KvStore, LocalStore, Subscription};
use crate::config::SyncConfig;
use crate::models::{Entity, MutationKind, MutationReceipt, PendingMutation};

pub use engine::{ReconcileOutcome, SyncEngine};
pub use error::SyncError;
use scheduler::Scheduler;

/// Running sync engine. Dropping the handle stops background work without
/// waiting for it; call [`SyncHandle::shutdown`] for a graceful stop.
pub struct SyncHandle {
    engine: Arc<SyncEngine>,
    scheduler: Arc<Scheduler>,
    runtime: Handle,
    runner: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Open the engine over `kv` and start the background scheduler. Queued
    /// mutations left over from a previous run are flushed by the first
    /// sweep. Must be called from within a tokio runtime.
    pub fn start(
        config: SyncConfig,
        kv: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteApi>,
    ) -> Result<Self, SyncError> {
        let sweep_interval = config.sweep_interval;
        let (engine, nudges) = SyncEngine::new(config, LocalStore::new(kv), remote)?;
        let engine = Arc::new(engine);
        let scheduler = Scheduler::new(Arc::clone(&engine));

        let runtime = Handle::current();
        let runner = runtime.spawn(Arc::clone(&scheduler).run(nudges, sweep_interval));
        Ok(Self {
            engine,
            scheduler,
            runtime,
            runner: Some(runner),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        self.engine.config()
    }

    /// Observe `key`. The first state is delivered immediately (`Pending`
    /// until the local copy is loaded); a missing or stale copy triggers a
    /// background refresh.
    pub fn subscribe(&self, key: &str) -> Subscription {
        let subscription = self.engine.cache().subscribe(key);

        let engine = Arc::clone(&self.engine);
        let scheduler = Arc::clone(&self.scheduler);
        let key = key.to_string();
        self.runtime.spawn(async move {
            let local = match blocking(&engine, {
                let key = key.clone();
                move |engine| engine.hydrate(&key)
            })
            .await
            {
                Ok(local) => local,
                Err(e) => {
                    warn!(key, error = %e, "Could not load cached entity");
                    None
                }
            };
            let threshold = engine.config().staleness_threshold;
            if local.map_or(true, |e| e.is_stale(threshold)) {
                scheduler.join_or_start(&key, false);
            }
        });

        subscription
    }

    /// Read `key`, from the local cache when it is fresh or holds unsynced
    /// changes, from the server otherwise. When the server cannot be
    /// reached a stale local copy is returned instead of an error.
    pub async fn fetch(&self, key: &str) -> Result<Entity, SyncError> {
        let local = blocking(&self.engine, {
            let key = key.to_string();
            move |engine| engine.hydrate(&key)
        })
        .await?;

        if let Some(ref entity) = local {
            if entity.dirty {
                debug!(key, "Returning unsynced local entity");
                return visible(key, entity.clone());
            }
            if !entity.is_stale(self.config().staleness_threshold) {
                debug!(key, age = %entity.age_display(), "Cache hit");
                return visible(key, entity.clone());
            }
        }

        let timeout = self.config().fetch_timeout;
        let outcome = match tokio::time::timeout(timeout, self.scheduler.request(key, false)).await {
            Ok(outcome) => outcome,
            Err(_) => ReconcileOutcome::Failed(SyncError::Transient(format!(
                "no response within {}s",
                timeout.as_secs_f64()
            ))),
        };

        if let ReconcileOutcome::Failed(err) = outcome {
            let offline = err.is_transient() || err == SyncError::ShuttingDown;
            return match local {
                Some(stale) if offline && stale.is_visible() => {
                    warn!(key, error = %err, age = %stale.age_display(), "Serving stale entity");
                    Ok(stale)
                }
                _ => Err(err),
            };
        }

        let current = blocking(&self.engine, {
            let key = key.to_string();
            move |engine| engine.local_entity(&key)
        })
        .await?;
        match current {
            Some(entity) => visible(key, entity),
            None => Err(SyncError::NotFound(key.to_string())),
        }
    }

    /// Queue a write and apply it locally. Returns without touching the
    /// network; the scheduler pushes it in the background.
    pub fn mutate(
        &self,
        key: &str,
        kind: MutationKind,
        payload: Value,
    ) -> Result<MutationReceipt, SyncError> {
        self.engine.mutate(key, kind, payload)
    }

    /// Reconcile `key` now, ignoring any backoff, and wait for the result.
    pub async fn force_sync(&self, key: &str) -> ReconcileOutcome {
        info!(key, "Forced sync");
        self.scheduler.request(key, true).await
    }

    pub fn invalidate(&self, key: &str) -> Result<bool, SyncError> {
        self.engine.invalidate(key)
    }

    pub fn pending(&self, key: &str) -> Result<Vec<PendingMutation>, SyncError> {
        self.engine.pending(key)
    }

    /// Keys with unsynced local changes.
    pub fn dirty_keys(&self) -> Result<Vec<String>, SyncError> {
        self.engine.dirty_keys()
    }

    pub fn failed_mutations(&self, key: &str) -> Result<Vec<PendingMutation>, SyncError> {
        self.engine.failed_mutations(key)
    }

    pub fn resubmit_failed(&self, key: &str) -> Result<usize, SyncError> {
        self.engine.resubmit_failed(key)
    }

    /// Stop background work, giving in-flight reconciliations up to
    /// `shutdown_grace` to finish. Queued mutations stay on disk.
    pub async fn shutdown(mut self) {
        self.scheduler.shutdown(self.config().shutdown_grace).await;
        if let Some(runner) = self.runner.take() {
            let _ = runner.await;
        }
        info!("Sync engine stopped");
    }

    /// Shut down and wipe every local record, queued mutations included.
    /// Open subscriptions end.
    pub async fn logout(self) -> Result<(), SyncError> {
        let engine = Arc::clone(&self.engine);
        self.shutdown().await;
        blocking(&engine, |engine| engine.clear()).await
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.scheduler.signal_shutdown();
    }
}

/// Run a store operation on the blocking pool.
async fn blocking<T, F>(engine: &Arc<SyncEngine>, f: F) -> Result<T, SyncError>
where
    T: Send + 'static,
    F: FnOnce(&SyncEngine) -> Result<T, SyncError> + Send + 'static,
{
    let engine = Arc::clone(engine);
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| SyncError::Storage(e.to_string()))?
}

fn visible(key: &str, entity: Entity) -> Result<Entity, SyncError> {
    if entity.is_visible() {
        Ok(entity)
    } else {
        Err(SyncError::NotFound(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::cache::{CacheState, MemoryStore};
    use serde_json::json;
    use std::time::Duration;
    use crate::sync::testing::FakeRemote;
    use tokio::time::Instant;

    fn config() -> SyncConfig {
        SyncConfig {
            retry_jitter: 0.0,
            ..SyncConfig::default()
        }
    }

    fn start(remote: &Arc<FakeRemote>, kv: &Arc<MemoryStore>, config: SyncConfig) -> SyncHandle {
        SyncHandle::start(config, kv.clone(), remote.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_reads_your_writes() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_record("task-1", json!({"title": "server"}));
        remote.set_latency(Duration::from_secs(60));
        let handle = start(&remote, &Arc::new(MemoryStore::new()), config());

        handle.mutate("task-1", MutationKind::Update, json!({"title": "local"})).unwrap();
        let entity = handle.fetch("task-1").await.unwrap();
        assert_eq!(entity.payload, json!({"title": "local"}));
        assert!(entity.dirty);
        assert_eq!(remote.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_deleted_locally_is_not_found() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_latency(Duration::from_secs(60));
        let handle = start(&remote, &Arc::new(MemoryStore::new()), config());

        handle.mutate("task-1", MutationKind::Create, json!(1)).unwrap();
        handle.mutate("task-1", MutationKind::Delete, Value::Null).unwrap();
        assert_eq!(handle.fetch("task-1").await, Err(SyncError::NotFound("task-1".into())));
    }

    #[tokio::test]
    async fn test_fetch_miss_then_hit() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_record("task-1", json!({"title": "Buy milk"}));
        let handle = start(&remote, &Arc::new(MemoryStore::new()), config());

        let first = handle.fetch("task-1").await.unwrap();
        assert_eq!(first.payload, json!({"title": "Buy milk"}));
        assert!(!first.dirty);
        assert_eq!(remote.fetch_count(), 1);

        let second = handle.fetch("task-1").await.unwrap();
        assert_eq!(second.payload, first.payload);
        assert_eq!(remote.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_fetch_unknown_key_is_not_found() {
        let remote = Arc::new(FakeRemote::new());
        let handle = start(&remote, &Arc::new(MemoryStore::new()), config());

        assert_eq!(handle.fetch("nope").await, Err(SyncError::NotFound("nope".into())));
    }

    #[tokio::test]
    async fn test_fetch_serves_stale_entity_when_offline() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_record("task-1", json!(1));
        let config = SyncConfig {
            staleness_threshold: Duration::ZERO,
            ..config()
        };
        let handle = start(&remote, &Arc::new(MemoryStore::new()), config);
        handle.fetch("task-1").await.unwrap();

        std::thread::sleep(Duration::from_millis(2));
        remote.fail_fetches_with(ApiError::Network("unreachable".into()));
        let stale = handle.fetch("task-1").await.unwrap();
        assert_eq!(stale.payload, json!(1));
        assert_eq!(remote.fetch_count(), 2);

        assert!(matches!(handle.fetch("other").await, Err(SyncError::Transient(_))));

        remote.clear_fetch_failures();
        remote.set_record("task-1", json!(2));
        std::thread::sleep(Duration::from_millis(2));
        let refreshed = handle.fetch("task-1").await.unwrap();
        assert_eq!(refreshed.payload, json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_force_sync_is_single_flight() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_record("task-1", json!(1));
        remote.set_latency(Duration::from_millis(100));
        let handle = start(&remote, &Arc::new(MemoryStore::new()), config());

        let outcomes = futures::future::join_all((0..10).map(|_| handle.force_sync("task-1"))).await;
        assert_eq!(remote.fetch_count(), 1);
        assert!(outcomes
            .iter()
            .all(|o| *o == ReconcileOutcome::Applied { changed: true }));
    }

    #[tokio::test]
    async fn test_subscribe_replays_then_follows() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_record("task-1", json!({"title": "a"}));
        let handle = start(&remote, &Arc::new(MemoryStore::new()), config());

        let mut sub = handle.subscribe("task-1");
        assert_eq!(sub.next().await, Some(CacheState::Pending));
        let loaded = sub.next().await.unwrap();
        assert_eq!(loaded.entity().unwrap().payload, json!({"title": "a"}));

        handle.mutate("task-1", MutationKind::Update, json!({"title": "b"})).unwrap();
        let edited = sub.next().await.unwrap();
        assert_eq!(edited.entity().unwrap().payload, json!({"title": "b"}));
        assert!(edited.entity().unwrap().dirty);

        // Late subscribers start from the latest state
        let mut late = handle.subscribe("task-1");
        let first = late.next().await.unwrap();
        assert_eq!(first.entity().unwrap().payload, json!({"title": "b"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_exhausted_after_backoff_schedule() {
        let remote = Arc::new(FakeRemote::new());
        remote.fail_pushes_with(ApiError::Server {
            status: 503,
            body: "unavailable".into(),
        });
        let handle = start(&remote, &Arc::new(MemoryStore::new()), config());
        let mut sub = handle.subscribe("task-1");

        let started = Instant::now();
        handle.mutate("task-1", MutationKind::Update, json!({"n": 1})).unwrap();

        let error = loop {
            match sub.next().await {
                Some(CacheState::Failed { error, .. }) => break error,
                Some(_) => continue,
                None => panic!("subscription ended"),
            }
        };
        let elapsed = started.elapsed();

        assert!(matches!(error, SyncError::QueueExhausted { attempts: 9, .. }), "{error:?}");
        assert!(elapsed >= Duration::from_secs(255), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(256), "{elapsed:?}");
        assert_eq!(remote.push_count(), 9);
        assert!(handle.pending("task-1").unwrap().is_empty());
        assert_eq!(handle.failed_mutations("task-1").unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_keeps_queued_mutations() {
        let remote = Arc::new(FakeRemote::new());
        remote.fail_pushes_with(ApiError::Network("offline".into()));
        let kv = Arc::new(MemoryStore::new());
        let handle = start(&remote, &kv, config());

        handle.mutate("task-1", MutationKind::Create, json!({"title": "a"})).unwrap();
        handle.mutate("task-1", MutationKind::Update, json!({"title": "b"})).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.shutdown().await;

        let store = LocalStore::new(kv);
        let queue = store.queue("task-1").unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].attempt_count, 1);
        assert_eq!(store.list_dirty().unwrap(), vec!["task-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_flushes_persisted_queue() {
        let remote = Arc::new(FakeRemote::new());
        let kv = Arc::new(MemoryStore::new());
        LocalStore::new(kv.clone())
            .save_queue(
                "task-1",
                &[PendingMutation::new(7, "task-1", MutationKind::Create, json!(1), None)],
            )
            .unwrap();

        let handle = start(&remote, &kv, config());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(remote.push_count(), 1);
        assert_eq!(remote.record("task-1").unwrap().payload, json!(1));
        assert!(handle.pending("task-1").unwrap().is_empty());
        assert_eq!(handle.mutate("task-2", MutationKind::Create, json!(2)).unwrap().id, 8);
    }

    #[tokio::test]
    async fn test_logout_wipes_everything() {
        let remote = Arc::new(FakeRemote::new());
        remote.fail_pushes_with(ApiError::Network("offline".into()));
        let kv = Arc::new(MemoryStore::new());
        let handle = start(&remote, &kv, config());

        handle.mutate("task-1", MutationKind::Create, json!(1)).unwrap();
        let mut sub = handle.subscribe("task-1");
        sub.next().await;
        handle.logout().await.unwrap();

        assert_eq!(sub.next().await, None);
        let store = LocalStore::new(kv);
        assert!(store.list_dirty().unwrap().is_empty());
        assert!(store.get("task-1").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_during_pull_is_pushed_after_it() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_record("task-1", json!({"title": "server"}));
        remote.set_latency(Duration::from_millis(100));
        let handle = start(&remote, &Arc::new(MemoryStore::new()), config());

        let (outcome, ()) = tokio::join!(handle.force_sync("task-1"), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.mutate("task-1", MutationKind::Update, json!({"title": "local"})).unwrap();
        });
        assert_eq!(outcome, ReconcileOutcome::Applied { changed: false });

        // Well before the next sweep
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(remote.push_count(), 1);
        assert_eq!(remote.record("task-1").unwrap().payload, json!({"title": "local"}));
        assert!(handle.pending("task-1").unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_after_create_flushes_without_sweep() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_latency(Duration::from_millis(100));
        let handle = start(&remote, &Arc::new(MemoryStore::new()), config());

        handle.mutate("task-1", MutationKind::Create, json!({"title": "a"})).unwrap();
        // Create is acknowledged at 100ms; the pull runs until 200ms
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.mutate("task-1", MutationKind::Update, json!({"title": "b"})).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(remote.push_count(), 2);
        assert!(handle.pending("task-1").unwrap().is_empty());
        assert_eq!(remote.record("task-1").unwrap().payload, json!({"title": "b"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_with_slow_push_stays_wiped() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_latency(Duration::from_secs(30));
        let kv = Arc::new(MemoryStore::new());
        let handle = start(&remote, &kv, config());

        handle.mutate("task-1", MutationKind::Create, json!({"title": "a"})).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(remote.push_count(), 1);

        let started = Instant::now();
        handle.logout().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(6));

        tokio::time::sleep(Duration::from_secs(120)).await;
        let store = LocalStore::new(kv);
        assert!(store.get("task-1").unwrap().is_none());
        assert!(store.list_dirty().unwrap().is_empty());
        assert!(remote.pushed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sweep_interval_still_runs() {
        let remote = Arc::new(FakeRemote::new());
        let kv = Arc::new(MemoryStore::new());
        LocalStore::new(kv.clone())
            .save_queue(
                "task-1",
                &[PendingMutation::new(1, "task-1", MutationKind::Create, json!(1), None)],
            )
            .unwrap();
        let config = SyncConfig {
            sweep_interval: Duration::ZERO,
            ..config()
        };

        let handle = start(&remote, &kv, config);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(remote.push_count(), 1);
        assert!(handle.pending("task-1").unwrap().is_empty());
    }
}
