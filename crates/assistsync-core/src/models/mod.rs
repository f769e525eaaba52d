//! Data models for cached assistant data.
//!
//! - `Entity`: a cached record keyed by a stable string key
//! - `PendingMutation`, `MutationKind`: queued local writes
//! - `MutationReceipt`: acknowledgement handed back by `mutate`

pub mod entity;
pub mod mutation;

pub use entity::Entity;
pub use mutation::{MutationKind, MutationReceipt, PendingMutation};
