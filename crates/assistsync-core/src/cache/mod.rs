//! Local caching for offline data access.
//!
//! - `store`: the durable key/value capability (`FileStore`, `MemoryStore`)
//! - `local`: typed entity / mutation-queue records on top of it
//! - `observable`: per-key reactive snapshots handed to consumers

pub mod local;
pub mod observable;
pub mod store;

pub use local::LocalStore;
pub use observable::{CacheState, ObservableCache, Subscription};
pub use store::{FileStore, KvStore, MemoryStore, StoreError};
