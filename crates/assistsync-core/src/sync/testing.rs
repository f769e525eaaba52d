//! In-memory `RemoteApi` with per-record versions, for engine tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::api::{ApiError, RemoteAck, RemoteApi, RemoteRecord};
use crate::models::{MutationKind, PendingMutation};

#[derive(Default)]
struct State {
    records: HashMap<String, RemoteRecord>,
    revision: u64,
    pushed: Vec<PendingMutation>,
    push_attempts: usize,
    fetches: usize,
    push_failure: Option<ApiError>,
    fetch_failure: Option<ApiError>,
    latency: Duration,
}

impl State {
    fn next_version(&mut self) -> String {
        self.revision += 1;
        format!("v{}", self.revision)
    }
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<State>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Write a record as another client would, bumping its version.
    pub fn set_record(&self, key: &str, payload: Value) {
        let mut state = self.state();
        let version = state.next_version();
        state.records.insert(
            key.to_string(),
            RemoteRecord {
                payload,
                version: Some(version),
            },
        );
    }

    pub fn remove_record(&self, key: &str) {
        self.state().records.remove(key);
    }

    pub fn record(&self, key: &str) -> Option<RemoteRecord> {
        self.state().records.get(key).cloned()
    }

    /// Mutations the server accepted, in order.
    pub fn pushed(&self) -> Vec<PendingMutation> {
        self.state().pushed.clone()
    }

    /// Push attempts, failed ones included.
    pub fn push_count(&self) -> usize {
        self.state().push_attempts
    }

    pub fn fetch_count(&self) -> usize {
        self.state().fetches
    }

    pub fn fail_pushes_with(&self, err: ApiError) {
        self.state().push_failure = Some(err);
    }

    pub fn clear_push_failures(&self) {
        self.state().push_failure = None;
    }

    pub fn fail_fetches_with(&self, err: ApiError) {
        self.state().fetch_failure = Some(err);
    }

    pub fn clear_fetch_failures(&self) {
        self.state().fetch_failure = None;
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn fetch(&self, key: &str) -> Result<Option<RemoteRecord>, ApiError> {
        self.state().fetches += 1;
        self.delay().await;

        let state = self.state();
        if let Some(err) = state.fetch_failure.clone() {
            return Err(err);
        }
        Ok(state.records.get(key).cloned())
    }

    async fn push(
        &self,
        mutation: &PendingMutation,
        if_match: Option<&str>,
    ) -> Result<RemoteAck, ApiError> {
        self.state().push_attempts += 1;
        self.delay().await;

        let mut state = self.state();
        if let Some(err) = state.push_failure.clone() {
            return Err(err);
        }

        let key = mutation.key.clone();
        let current = state.records.get(&key).and_then(|r| r.version.clone());
        if let Some(expected) = if_match {
            if current.as_deref() != Some(expected) {
                return Err(ApiError::Conflict(format!(
                    "{key}: expected {expected}, found {current:?}"
                )));
            }
        }

        let ack = match mutation.kind {
            MutationKind::Create if current.is_some() => {
                return Err(ApiError::Conflict(format!("{key} already exists")));
            }
            MutationKind::Create | MutationKind::Update => {
                let version = state.next_version();
                state.records.insert(
                    key,
                    RemoteRecord {
                        payload: mutation.payload.clone(),
                        version: Some(version.clone()),
                    },
                );
                RemoteAck {
                    version: Some(version),
                }
            }
            MutationKind::Delete => {
                state.next_version();
                state.records.remove(&key);
                RemoteAck { version: None }
            }
        };
        state.pushed.push(mutation.clone());
        Ok(ack)
    }
}
