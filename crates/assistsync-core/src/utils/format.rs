use chrono::{DateTime, Local, Utc};
use serde_json::Value;

/// Truncate a string to a maximum number of characters, adding an ellipsis
/// if needed
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Format a timestamp in local time, e.g. "Mar 04, 2026 14:05"
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%b %d, %Y %H:%M").to_string()
}

/// Single-line JSON rendering of a payload for listings
pub fn payload_preview(payload: &Value, max_len: usize) -> String {
    match payload {
        Value::Null => "-".to_string(),
        other => truncate(&other.to_string(), max_len),
    }
}
