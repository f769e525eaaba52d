use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A cached domain record (assistant task, schedule item, ...).
///
/// `version` is the last version the server confirmed. Optimistic local
/// writes change `payload` and set `dirty`, but never touch `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: String,
    pub payload: Value,
    pub version: Option<String>,
    pub last_synced_at: DateTime<Utc>,
    #[serde(default)]
    pub dirty: bool,
    /// Local tombstone for a delete that the server has not confirmed yet.
    #[serde(default)]
    pub deleted: bool,
}

impl Entity {
    /// Build an entity from an authoritative server record.
    pub fn from_remote(key: impl Into<String>, payload: Value, version: Option<String>) -> Self {
        Self {
            key: key.into(),
            payload,
            version,
            last_synced_at: Utc::now(),
            dirty: false,
            deleted: false,
        }
    }

    /// Whether consumers should see this entity at all.
    pub fn is_visible(&self) -> bool {
        !self.deleted
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.last_synced_at).num_minutes()
    }

    pub fn is_stale(&self, threshold: std::time::Duration) -> bool {
        let threshold = Duration::from_std(threshold).unwrap_or(Duration::MAX);
        Utc::now() - self.last_synced_at > threshold
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity_synced(minutes_ago: i64) -> Entity {
        let mut entity = Entity::from_remote("task-1", json!({"title": "Buy milk"}), Some("v1".into()));
        entity.last_synced_at = Utc::now() - Duration::minutes(minutes_ago);
        entity
    }

    #[test]
    fn test_age_display_just_now() {
        assert_eq!(entity_synced(0).age_display(), "just now");
    }

    #[test]
    fn test_age_display_rounding() {
        assert_eq!(entity_synced(5).age_display(), "5m ago");
        assert_eq!(entity_synced(90).age_display(), "2h ago");
        assert_eq!(entity_synced(60 * 24 + 60).age_display(), "1d ago");
    }

    #[test]
    fn test_is_stale() {
        let threshold = std::time::Duration::from_secs(60 * 60);
        assert!(!entity_synced(0).is_stale(threshold));
        assert!(entity_synced(61).is_stale(threshold));
    }

    #[test]
    fn test_entity_without_flags_deserializes() {
        let raw = r#"{"key":"k","payload":1,"version":null,"last_synced_at":"2024-01-01T00:00:00Z"}"#;
        let entity: Entity = serde_json::from_str(raw).unwrap();
        assert!(!entity.dirty);
        assert!(entity.is_visible());
    }
}
