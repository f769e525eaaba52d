use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MutationKind::Create => write!(f, "create"),
            MutationKind::Update => write!(f, "update"),
            MutationKind::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for MutationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(MutationKind::Create),
            "update" => Ok(MutationKind::Update),
            "delete" => Ok(MutationKind::Delete),
            other => Err(format!("unknown mutation kind: {}", other)),
        }
    }
}

/// A queued local write that the server has not confirmed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: u64,
    pub key: String,
    pub kind: MutationKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Entity version when the mutation was enqueued
    pub base_version: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PendingMutation {
    pub fn new(
        id: u64,
        key: impl Into<String>,
        kind: MutationKind,
        payload: Value,
        base_version: Option<String>,
    ) -> Self {
        Self {
            id,
            key: key.into(),
            kind,
            payload,
            attempt_count: 0,
            next_retry_at: None,
            created_at: Utc::now(),
            base_version,
            last_error: None,
        }
    }

    /// Reset retry bookkeeping so the mutation can be queued again.
    pub fn reset_attempts(&mut self) {
        self.attempt_count = 0;
        self.next_retry_at = None;
        self.last_error = None;
    }
}

/// Acknowledgement returned by `mutate`. The write is durable locally and
/// queued for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationReceipt {
    pub id: u64,
    pub queued: usize,
}
