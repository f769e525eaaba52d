//! In-memory projection of cached entities, one watch channel per key.
//!
//! Subscribers always see the latest state first and then every later
//! transition. Identical states are never re-emitted, and a lagging
//! subscriber skips straight to the newest state instead of slowing the
//! writer down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::Stream;
use tokio::sync::watch;

use crate::models::Entity;
use crate::sync::SyncError;

#[derive(Debug, Clone, PartialEq)]
pub enum CacheState {
    /// Nothing known yet; a load is in progress.
    Pending,
    Present(Entity),
    /// Neither the cache nor the server has this key.
    Absent,
    /// A terminal sync error. `last` keeps the last known value so the UI
    /// can still render cached data next to the error.
    Failed {
        last: Option<Entity>,
        error: SyncError,
    },
}

impl CacheState {
    /// Present for visible entities, Absent for tombstones and `None`.
    pub fn from_entity(entity: Option<Entity>) -> Self {
        match entity {
            Some(entity) if entity.is_visible() => CacheState::Present(entity),
            _ => CacheState::Absent,
        }
    }

    pub fn entity(&self) -> Option<&Entity> {
        match self {
            CacheState::Present(entity) => Some(entity),
            CacheState::Failed { last, .. } => last.as_ref(),
            CacheState::Pending | CacheState::Absent => None,
        }
    }

    pub fn error(&self) -> Option<&SyncError> {
        match self {
            CacheState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CacheState::Pending)
    }
}

type Slot = Arc<watch::Sender<CacheState>>;

#[derive(Default)]
pub struct ObservableCache {
    slots: Mutex<HashMap<String, Slot>>,
}

impl ObservableCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, key: &str) -> Slot {
        self.slots()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(watch::channel(CacheState::Pending).0))
            .clone()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.slots().keys().cloned().collect()
    }

    pub fn current(&self, key: &str) -> Option<CacheState> {
        let slot = self.slots().get(key).cloned()?;
        let state = slot.borrow().clone();
        Some(state)
    }

    /// Replace the state for `key`, notifying subscribers only when it
    /// actually changed. Returns whether anything was emitted.
    pub fn publish(&self, key: &str, state: CacheState) -> bool {
        self.slot(key).send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        })
    }

    /// Publish `state` only while the slot is still `Pending`.
    pub fn publish_if_pending(&self, key: &str, state: CacheState) -> bool {
        self.slot(key).send_if_modified(|current| {
            if current.is_pending() && *current != state {
                *current = state;
                true
            } else {
                false
            }
        })
    }

    /// Update bookkeeping fields without notifying anyone.
    pub fn touch(&self, key: &str, f: impl FnOnce(&mut CacheState)) {
        if let Some(slot) = self.slots().get(key).cloned() {
            slot.send_if_modified(|current| {
                f(current);
                false
            });
        }
    }

    pub fn subscribe(&self, key: &str) -> Subscription {
        Subscription {
            key: key.to_string(),
            rx: self.slot(key).subscribe(),
            primed: false,
        }
    }

    /// Drop the snapshot for `key`; open subscriptions end.
    pub fn evict(&self, key: &str) {
        self.slots().remove(key);
    }

    pub fn clear(&self) {
        self.slots().clear();
    }
}

/// A lazy, restartable sequence of states for one key.
///
/// The first `next()` yields the current state; later calls wait for the
/// following transition. Cloning restarts from the latest state.
pub struct Subscription {
    key: String,
    rx: watch::Receiver<CacheState>,
    primed: bool,
}

impl Clone for Subscription {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            rx: self.rx.clone(),
            primed: false,
        }
    }
}

impl Subscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn current(&self) -> CacheState {
        self.rx.borrow().clone()
    }

    /// `None` once the snapshot has been evicted.
    pub async fn next(&mut self) -> Option<CacheState> {
        if !self.primed {
            self.primed = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn into_stream(self) -> impl Stream<Item = CacheState> + Send + Unpin {
        Box::pin(futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|state| (state, sub))
        }))
    }
}
