//! assistsync core library.
//!
//! Offline-first access to remote records: reads are served from a durable
//! local cache, writes are applied locally at once and pushed to the server
//! in the background, and consumers observe each key as a stream of states.
//!
//! ```no_run
//! use std::sync::Arc;
//! use assistsync_core::{ApiClient, FileStore, MutationKind, SyncConfig, SyncHandle};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let store = Arc::new(FileStore::new("/tmp/assistsync")?);
//! let remote = Arc::new(ApiClient::new("http://localhost:8080/api")?);
//! let sync = SyncHandle::start(SyncConfig::default(), store, remote)?;
//!
//! sync.mutate("task-1", MutationKind::Create, serde_json::json!({"title": "Buy milk"}))?;
//! let task = sync.fetch("task-1").await?;
//! println!("{}", task.payload);
//! sync.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod credentials;
pub mod models;
pub mod sync;
pub mod utils;

pub use api::{ApiClient, ApiError, RemoteAck, RemoteApi, RemoteRecord};
pub use cache::{CacheState, FileStore, KvStore, MemoryStore, StoreError, Subscription};
pub use config::{Config, SyncConfig};
pub use credentials::TokenStore;
pub use models::{Entity, MutationKind, MutationReceipt, PendingMutation};
pub use sync::{ReconcileOutcome, SyncError, SyncHandle};
