//! Sync engine: read-through cache, write-behind queue, conflict handling.
//!
//! The engine is the only writer of both the local store and the observable
//! cache. Every state change for a key happens inside that key's critical
//! section, and the section is never held across an `.await`: network calls
//! happen between sections, and each section re-reads the store before it
//! commits anything.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, RemoteAck, RemoteApi, RemoteRecord};
use crate::cache::{CacheState, LocalStore, ObservableCache};
use crate::config::SyncConfig;
use crate::models::{Entity, MutationKind, MutationReceipt, PendingMutation};

use super::backoff::Backoff;
use super::SyncError;

/// Result of one reconciliation of a key.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Local and remote state agree. `changed` is false when nothing had to
    /// be pushed or pulled.
    Applied { changed: bool },
    /// At least one local write lost against a newer server version and was
    /// replaced by it.
    Conflict,
    /// The head of the queue is still backing off; nothing was sent.
    Deferred,
    Failed(SyncError),
}

/// What happened to the mutation at the head of the queue.
enum PushStep {
    Committed,
    ConflictResolved,
    /// Transient failure; the mutation stays queued and backs off.
    Retry(SyncError),
    /// Moved to the failed list.
    Rejected(SyncError),
    /// The mutation left the queue while it was on the wire (local state was
    /// wiped); nothing was written.
    Discarded,
}

#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn get(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn clear(&self) {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

fn guard(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SyncEngine {
    config: SyncConfig,
    backoff: Backoff,
    store: LocalStore,
    remote: Arc<dyn RemoteApi>,
    cache: ObservableCache,
    locks: KeyLocks,
    /// Earliest instant the queue head of a key may be pushed again
    retry_gates: Mutex<HashMap<String, Instant>>,
    next_id: AtomicU64,
    /// Bumped by `clear`; results of a reconciliation that started before
    /// the wipe are dropped
    generation: RwLock<u64>,
    nudge: mpsc::UnboundedSender<String>,
}

impl SyncEngine {
    /// Returns the engine and the receiving end of its wake-up channel; every
    /// `mutate` sends the touched key there so the scheduler can flush it.
    pub fn new(
        config: SyncConfig,
        store: LocalStore,
        remote: Arc<dyn RemoteApi>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>), SyncError> {
        let (nudge, nudges) = mpsc::unbounded_channel();
        let next_id = store.max_mutation_id()? + 1;
        let engine = Self {
            backoff: Backoff::new(&config),
            config,
            store,
            remote,
            cache: ObservableCache::new(),
            locks: KeyLocks::default(),
            retry_gates: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(next_id),
            generation: RwLock::new(0),
            nudge,
        };
        Ok((engine, nudges))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn cache(&self) -> &ObservableCache {
        &self.cache
    }

    /// Current generation, held until the guard drops. `None` once `clear`
    /// has run since `started`.
    fn same_generation(&self, started: u64) -> Option<RwLockReadGuard<'_, u64>> {
        let generation = self.generation.read().unwrap_or_else(|e| e.into_inner());
        (*generation == started).then_some(generation)
    }

    fn gates(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.retry_gates.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish an entity, keeping a terminal error attached until the
    /// consumer writes to the key again.
    fn publish_entity(&self, key: &str, entity: Option<Entity>) -> bool {
        let next = CacheState::from_entity(entity);
        match self.cache.current(key) {
            Some(CacheState::Failed { error, .. }) => self.cache.publish(
                key,
                CacheState::Failed {
                    last: next.entity().cloned(),
                    error,
                },
            ),
            _ => self.cache.publish(key, next),
        }
    }

    fn publish_error(&self, key: &str, entity: Option<Entity>, error: SyncError) {
        let last = entity.filter(Entity::is_visible);
        self.cache.publish(key, CacheState::Failed { last, error });
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Load the local entity for `key` into the snapshot if the snapshot has
    /// not been populated yet. Blocking; run it off the async workers.
    pub fn hydrate(&self, key: &str) -> Result<Option<Entity>, SyncError> {
        let lock = self.locks.get(key);
        let _guard = guard(&lock);

        let entity = self.store.get(key)?;
        if let Some(ref entity) = entity {
            if self
                .cache
                .publish_if_pending(key, CacheState::from_entity(Some(entity.clone())))
            {
                debug!(key, dirty = entity.dirty, "Hydrated snapshot from local store");
            }
        }
        Ok(entity)
    }

    /// The local entity, tombstones included.
    pub fn local_entity(&self, key: &str) -> Result<Option<Entity>, SyncError> {
        Ok(self.store.get(key)?)
    }

    pub fn pending(&self, key: &str) -> Result<Vec<PendingMutation>, SyncError> {
        Ok(self.store.queue(key)?)
    }

    pub fn dirty_keys(&self) -> Result<Vec<String>, SyncError> {
        Ok(self.store.list_dirty()?)
    }

    pub fn failed_mutations(&self, key: &str) -> Result<Vec<PendingMutation>, SyncError> {
        Ok(self.store.failed(key)?)
    }

    /// Keys a periodic sweep should reconcile: anything with queued writes,
    /// plus observed keys whose snapshot has gone stale.
    pub fn sweep_candidates(&self) -> Result<Vec<String>, SyncError> {
        let mut keys = self.store.list_dirty()?;
        for key in self.cache.keys() {
            if keys.contains(&key) {
                continue;
            }
            let stale = match self.cache.current(&key) {
                Some(state) => state
                    .entity()
                    .map_or(false, |e| e.is_stale(self.config.staleness_threshold)),
                None => false,
            };
            if stale {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// When the queue head of `key` may next be pushed, if it is backing off.
    pub fn retry_at(&self, key: &str) -> Option<Instant> {
        self.gates()
            .get(key)
            .copied()
            .filter(|at| *at > Instant::now())
    }

    fn gate_open(&self, key: &str, head: &PendingMutation) -> bool {
        let now = Instant::now();
        let at = *self.gates().entry(key.to_string()).or_insert_with(|| {
            // First look at this key since startup: honour a persisted backoff
            let remaining = head
                .next_retry_at
                .and_then(|at| (at - Utc::now()).to_std().ok())
                .unwrap_or_default();
            now + remaining
        });
        now >= at
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Queue a write and apply it to the local projection immediately.
    /// Never touches the network.
    pub fn mutate(
        &self,
        key: &str,
        kind: MutationKind,
        payload: Value,
    ) -> Result<MutationReceipt, SyncError> {
        let lock = self.locks.get(key);
        let receipt = {
            let _guard = guard(&lock);

            let existing = self.store.get(key)?;
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let base_version = existing.as_ref().and_then(|e| e.version.clone());
            let mutation = PendingMutation::new(id, key, kind, payload, base_version);

            let mut queue = self.store.queue(key)?;
            queue.push(mutation.clone());
            self.store.save_queue(key, &queue)?;

            let mut entity = existing.unwrap_or_else(|| Entity {
                key: key.to_string(),
                payload: Value::Null,
                version: None,
                last_synced_at: Utc::now(),
                dirty: true,
                deleted: false,
            });
            apply_optimistic(&mut entity, &mutation);
            self.store.put(&entity)?;
            self.cache.publish(key, CacheState::from_entity(Some(entity)));

            MutationReceipt {
                id,
                queued: queue.len(),
            }
        };

        debug!(key, id = receipt.id, %kind, queued = receipt.queued, "Mutation queued");
        if self.nudge.send(key.to_string()).is_err() {
            debug!(key, "Scheduler not running; mutation stays queued");
        }
        Ok(receipt)
    }

    /// Move failed mutations for `key` back onto its queue, re-applying them
    /// optimistically. Returns how many were resubmitted.
    pub fn resubmit_failed(&self, key: &str) -> Result<usize, SyncError> {
        let lock = self.locks.get(key);
        let count = {
            let _guard = guard(&lock);

            let failed = self.store.failed(key)?;
            if failed.is_empty() {
                return Ok(0);
            }
            let mut queue = self.store.queue(key)?;
            let mut entity = self.store.get(key)?.unwrap_or_else(|| Entity {
                key: key.to_string(),
                payload: Value::Null,
                version: None,
                last_synced_at: Utc::now(),
                dirty: true,
                deleted: true,
            });
            for mut mutation in failed.iter().cloned() {
                mutation.reset_attempts();
                apply_optimistic(&mut entity, &mutation);
                queue.push(mutation);
            }
            self.store.save_queue(key, &queue)?;
            self.store.save_failed(key, &[])?;
            self.store.put(&entity)?;
            self.gates().remove(key);
            self.cache.publish(key, CacheState::from_entity(Some(entity)));
            failed.len()
        };

        info!(key, count, "Resubmitted failed mutations");
        let _ = self.nudge.send(key.to_string());
        Ok(count)
    }

    /// Drop the cached copy of `key` so the next read goes to the server.
    /// Entities with unsynced changes are kept. Returns whether anything was
    /// evicted.
    pub fn invalidate(&self, key: &str) -> Result<bool, SyncError> {
        let lock = self.locks.get(key);
        let evicted = {
            let _guard = guard(&lock);

            let queued = !self.store.queue(key)?.is_empty();
            match self.store.get(key)? {
                Some(entity) if entity.dirty || queued => false,
                _ => {
                    self.store.delete(key)?;
                    self.cache.publish(key, CacheState::Pending);
                    true
                }
            }
        };
        debug!(key, evicted, "Invalidated snapshot");
        let _ = self.nudge.send(key.to_string());
        Ok(evicted)
    }

    /// Wipe every durable record and snapshot. Open subscriptions end.
    pub fn clear(&self) -> Result<(), SyncError> {
        let mut generation = self.generation.write().unwrap_or_else(|e| e.into_inner());
        *generation += 1;
        self.store.clear()?;
        self.cache.clear();
        self.gates().clear();
        self.locks.clear();
        info!("Local cache cleared");
        Ok(())
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Push the queued mutations for `key` in order, then pull the
    /// authoritative record. `forced` ignores a pending backoff for the
    /// first push.
    ///
    /// Callers must make sure only one reconciliation per key runs at a
    /// time; the scheduler does.
    pub async fn reconcile(&self, key: &str, forced: bool) -> ReconcileOutcome {
        let mut changed = false;
        let mut conflict = false;
        let mut terminal: Option<SyncError> = None;
        let mut bypass_gate = forced;
        let started = *self.generation.read().unwrap_or_else(|e| e.into_inner());

        loop {
            let (head, if_match) = match self.queue_head(key) {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(e) => return ReconcileOutcome::Failed(e),
            };
            if !bypass_gate && !self.gate_open(key, &head) {
                debug!(key, id = head.id, "Queue head still backing off");
                return terminal.map_or(ReconcileOutcome::Deferred, ReconcileOutcome::Failed);
            }
            bypass_gate = false;

            let result = self.remote.push(&head, if_match.as_deref()).await;
            let step = match result {
                Ok(ack) => self.commit_push(key, &head, ack, started),
                Err(err) if err.is_conflict() => self.resolve_conflict(key, &head, started).await,
                Err(err) if err.is_retryable() => self.record_failure(key, &head, &err),
                Err(err) => self.reject(key, &head, SyncError::from_api(key, &err), &err),
            };

            match step {
                Ok(PushStep::Committed) => changed = true,
                Ok(PushStep::ConflictResolved) => {
                    changed = true;
                    conflict = true;
                }
                Ok(PushStep::Retry(err)) => {
                    return ReconcileOutcome::Failed(terminal.unwrap_or(err));
                }
                Ok(PushStep::Rejected(err)) => {
                    changed = true;
                    terminal = Some(err);
                }
                Ok(PushStep::Discarded) => {
                    debug!(key, id = head.id, "Local state wiped during push");
                    return ReconcileOutcome::Applied { changed: false };
                }
                Err(e) => return ReconcileOutcome::Failed(e),
            }
        }

        match self.remote.fetch(key).await {
            Ok(record) => match self.apply_pull(key, record, started) {
                Ok(pulled) => changed |= pulled,
                Err(e) => return ReconcileOutcome::Failed(e),
            },
            Err(err) => {
                debug!(key, error = %err, "Pull failed");
                return ReconcileOutcome::Failed(terminal.unwrap_or_else(|| SyncError::from_api(key, &err)));
            }
        }

        if let Some(err) = terminal {
            ReconcileOutcome::Failed(err)
        } else if conflict {
            ReconcileOutcome::Conflict
        } else {
            ReconcileOutcome::Applied { changed }
        }
    }

    /// Head of the queue plus the version to send as `If-Match`.
    fn queue_head(&self, key: &str) -> Result<Option<(PendingMutation, Option<String>)>, SyncError> {
        let lock = self.locks.get(key);
        let _guard = guard(&lock);

        let Some(head) = self.store.queue(key)?.into_iter().next() else {
            return Ok(None);
        };
        let version = self.store.get(key)?.and_then(|e| e.version);
        Ok(Some((head, version)))
    }

    fn commit_push(
        &self,
        key: &str,
        mutation: &PendingMutation,
        ack: RemoteAck,
        started: u64,
    ) -> Result<PushStep, SyncError> {
        let Some(_generation) = self.same_generation(started) else {
            return Ok(PushStep::Discarded);
        };
        let lock = self.locks.get(key);
        let _guard = guard(&lock);

        let mut queue = self.store.queue(key)?;
        if !queue.iter().any(|m| m.id == mutation.id) {
            return Ok(PushStep::Discarded);
        }
        queue.retain(|m| m.id != mutation.id);
        self.store.save_queue(key, &queue)?;
        self.gates().remove(key);

        let entity = self.store.get(key)?;
        let published = match (mutation.kind, entity) {
            (MutationKind::Delete, Some(_)) if queue.is_empty() => {
                self.store.delete(key)?;
                None
            }
            (MutationKind::Delete, None) => None,
            (kind, entity) => {
                let mut entity = match entity {
                    Some(entity) => entity,
                    None => Entity::from_remote(key, mutation.payload.clone(), None),
                };
                // Later queued writes were based on our own write, not on
                // whatever the server held before it
                entity.version = if kind == MutationKind::Delete { None } else { ack.version };
                if queue.is_empty() {
                    entity.dirty = false;
                    entity.last_synced_at = Utc::now();
                }
                self.store.put(&entity)?;
                Some(entity)
            }
        };
        self.publish_entity(key, published);

        info!(key, id = mutation.id, kind = %mutation.kind, remaining = queue.len(), "Mutation applied");
        Ok(PushStep::Committed)
    }

    async fn resolve_conflict(
        &self,
        key: &str,
        mutation: &PendingMutation,
        started: u64,
    ) -> Result<PushStep, SyncError> {
        if mutation.kind == MutationKind::Delete {
            // Delete wins: a delete is never undone by a concurrent update
            warn!(key, id = mutation.id, "Version conflict on delete, deleting unconditionally");
            return match self.remote.push(mutation, None).await {
                Ok(ack) => self.commit_push(key, mutation, ack, started),
                Err(err) if err.is_retryable() => self.record_failure(key, mutation, &err),
                Err(err) => self.reject(key, mutation, SyncError::from_api(key, &err), &err),
            };
        }

        // Server wins: drop the local write; the pull that follows replaces
        // the optimistic payload with the server's.
        let Some(_generation) = self.same_generation(started) else {
            return Ok(PushStep::Discarded);
        };
        let lock = self.locks.get(key);
        let _guard = guard(&lock);

        let mut queue = self.store.queue(key)?;
        if !queue.iter().any(|m| m.id == mutation.id) {
            return Ok(PushStep::Discarded);
        }
        queue.retain(|m| m.id != mutation.id);
        self.store.save_queue(key, &queue)?;
        self.gates().remove(key);
        if queue.is_empty() {
            if let Some(mut entity) = self.store.get(key)? {
                entity.dirty = false;
                self.store.put(&entity)?;
            }
        }

        let note = SyncError::ConflictResolved {
            key: key.to_string(),
        };
        warn!(key, id = mutation.id, kind = %mutation.kind, note = %note, "Version conflict, keeping server version");
        Ok(PushStep::ConflictResolved)
    }

    fn record_failure(
        &self,
        key: &str,
        mutation: &PendingMutation,
        err: &ApiError,
    ) -> Result<PushStep, SyncError> {
        let lock = self.locks.get(key);
        let _guard = guard(&lock);

        let mut queue = self.store.queue(key)?;
        let Some(pos) = queue.iter().position(|m| m.id == mutation.id) else {
            return Ok(PushStep::Retry(SyncError::from_api(key, err)));
        };
        let failures = queue[pos].attempt_count + 1;

        if self.backoff.is_exhausted(failures) {
            let mut failed = queue.remove(pos);
            failed.attempt_count = failures;
            failed.next_retry_at = None;
            failed.last_error = Some(err.to_string());
            let error = SyncError::QueueExhausted {
                key: key.to_string(),
                id: failed.id,
                attempts: failures,
                last_error: err.to_string(),
            };
            self.dead_letter(key, &queue, failed, error.clone())?;
            error!(key, id = mutation.id, attempts = failures, error = %err, "Giving up on mutation");
            return Ok(PushStep::Rejected(error));
        }

        let delay = self.backoff.delay(failures);
        let entry = &mut queue[pos];
        entry.attempt_count = failures;
        entry.last_error = Some(err.to_string());
        entry.next_retry_at =
            chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d);
        self.store.save_queue(key, &queue)?;
        self.gates().insert(key.to_string(), Instant::now() + delay);

        warn!(
            key,
            id = mutation.id,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Push failed, backing off"
        );
        Ok(PushStep::Retry(SyncError::from_api(key, err)))
    }

    fn reject(
        &self,
        key: &str,
        mutation: &PendingMutation,
        error: SyncError,
        cause: &ApiError,
    ) -> Result<PushStep, SyncError> {
        let lock = self.locks.get(key);
        let _guard = guard(&lock);

        let mut queue = self.store.queue(key)?;
        let Some(pos) = queue.iter().position(|m| m.id == mutation.id) else {
            return Ok(PushStep::Rejected(error));
        };
        let mut failed = queue.remove(pos);
        failed.attempt_count += 1;
        failed.next_retry_at = None;
        failed.last_error = Some(cause.to_string());
        self.dead_letter(key, &queue, failed, error.clone())?;

        error!(key, id = mutation.id, error = %cause, "Mutation rejected by server");
        Ok(PushStep::Rejected(error))
    }

    /// Persist the shortened queue, park `failed`, and surface `error` on
    /// the key's snapshot. Caller holds the key's critical section.
    fn dead_letter(
        &self,
        key: &str,
        queue: &[PendingMutation],
        failed: PendingMutation,
        error: SyncError,
    ) -> Result<(), SyncError> {
        self.store.save_queue(key, queue)?;
        let mut parked = self.store.failed(key)?;
        parked.push(failed);
        self.store.save_failed(key, &parked)?;
        self.gates().remove(key);

        let mut entity = self.store.get(key)?;
        if queue.is_empty() {
            if let Some(ref mut entity) = entity {
                entity.dirty = false;
                self.store.put(entity)?;
            }
        }
        self.publish_error(key, entity, error);
        Ok(())
    }

    /// Apply the authoritative record unless local writes are still queued
    /// or the store was wiped since generation `started`. Returns whether
    /// local state changed.
    fn apply_pull(
        &self,
        key: &str,
        record: Option<RemoteRecord>,
        started: u64,
    ) -> Result<bool, SyncError> {
        let Some(_generation) = self.same_generation(started) else {
            debug!(key, "Local state wiped during pull, dropping result");
            return Ok(false);
        };
        let lock = self.locks.get(key);
        let _guard = guard(&lock);

        if !self.store.queue(key)?.is_empty() {
            debug!(key, "Mutations queued during pull, keeping local state");
            return Ok(false);
        }

        let local = self.store.get(key)?;
        match (local, record) {
            (None, None) => {
                self.publish_entity(key, None);
                Ok(false)
            }
            (Some(_), None) => {
                self.store.delete(key)?;
                self.publish_entity(key, None);
                info!(key, "Entity removed on server");
                Ok(true)
            }
            (Some(mut entity), Some(record))
                if !entity.dirty
                    && !entity.deleted
                    && entity.version == record.version
                    && entity.payload == record.payload =>
            {
                let synced_at = Utc::now();
                entity.last_synced_at = synced_at;
                self.store.put(&entity)?;
                self.cache.touch(key, |state| match state {
                    CacheState::Present(e) | CacheState::Failed { last: Some(e), .. } => {
                        e.last_synced_at = synced_at;
                    }
                    _ => {}
                });
                // A fresh snapshot (nothing hydrated yet) still needs its value
                self.cache
                    .publish_if_pending(key, CacheState::from_entity(Some(entity)));
                debug!(key, "Entity unchanged on server");
                Ok(false)
            }
            (_, Some(record)) => {
                let entity = Entity::from_remote(key, record.payload, record.version);
                self.store.put(&entity)?;
                self.publish_entity(key, Some(entity));
                info!(key, "Entity refreshed from server");
                Ok(true)
            }
        }
    }
}

fn apply_optimistic(entity: &mut Entity, mutation: &PendingMutation) {
    match mutation.kind {
        MutationKind::Delete => entity.deleted = true,
        MutationKind::Create | MutationKind::Update => {
            entity.payload = mutation.payload.clone();
            entity.deleted = false;
        }
    }
    entity.dirty = true;
}
