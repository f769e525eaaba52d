//! Remote client adapter.
//!
//! `RemoteApi` is the capability the sync engine talks to: fetch the
//! authoritative record for a key, or push one queued mutation. `ApiClient`
//! implements it over HTTP; tests substitute a scripted fake.

pub mod client;
pub mod error;

use async_trait::async_trait;
use serde_json::Value;

use crate::models::PendingMutation;

pub use client::ApiClient;
pub use error::ApiError;

/// Authoritative server state for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub payload: Value,
    pub version: Option<String>,
}

/// Server acceptance of a pushed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAck {
    /// New record version; `None` after a delete.
    pub version: Option<String>,
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// `Ok(None)` when the server has no record for `key`.
    async fn fetch(&self, key: &str) -> Result<Option<RemoteRecord>, ApiError>;

    /// Apply `mutation` on the server. With `if_match` set the server must
    /// reject the write with a conflict when its version differs.
    async fn push(
        &self,
        mutation: &PendingMutation,
        if_match: Option<&str>,
    ) -> Result<RemoteAck, ApiError>;
}
