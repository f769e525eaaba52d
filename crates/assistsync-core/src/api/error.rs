use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Failure of a single request against the remote service, classified so the
/// sync engine can tell retryable failures from terminal ones.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Client error {status}: {body}")]
    Client { status: u16, body: String },

    #[error("Version conflict: {0}")]
    Conflict(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error envelope the service sends with 4xx/5xx responses
#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// The `error` field of a JSON error envelope, or the raw body.
    pub fn error_message(body: &str) -> String {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(envelope) => envelope.error,
            Err(_) => body.to_string(),
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let body = Self::truncate_body(&Self::error_message(body));
        match status.as_u16() {
            404 => ApiError::NotFound(body),
            409 | 412 => ApiError::Conflict(body),
            408 => ApiError::Timeout,
            429 => ApiError::RateLimited,
            code @ 500..=599 => ApiError::Server { status: code, body },
            code @ 400..=499 => ApiError::Client { status: code, body },
            code => ApiError::InvalidResponse(format!("Status {}: {}", code, body)),
        }
    }

    /// Network failures, timeouts, rate limiting and 5xx responses are worth
    /// retrying with backoff. Everything else needs the caller to change
    /// something first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Network(_)
                | ApiError::Timeout
                | ApiError::RateLimited
                | ApiError::Server { .. }
                | ApiError::InvalidResponse(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Server { status, .. } | ApiError::Client { status, .. } => Some(*status),
            ApiError::RateLimited => Some(429),
            ApiError::Conflict(_) => Some(409),
            ApiError::NotFound(_) => Some(404),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::from_status(status, &err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> StatusCode {
        StatusCode::from_u16(code).unwrap()
    }

    #[test]
    fn test_from_status_classification() {
        assert!(matches!(ApiError::from_status(status(503), ""), ApiError::Server { status: 503, .. }));
        assert!(matches!(ApiError::from_status(status(400), "bad"), ApiError::Client { status: 400, .. }));
        assert!(matches!(ApiError::from_status(status(412), ""), ApiError::Conflict(_)));
        assert!(matches!(ApiError::from_status(status(409), ""), ApiError::Conflict(_)));
        assert!(matches!(ApiError::from_status(status(404), ""), ApiError::NotFound(_)));
        assert_eq!(ApiError::from_status(status(429), ""), ApiError::RateLimited);
    }

    #[test]
    fn test_retryable() {
        assert!(ApiError::Timeout.is_retryable());
        assert!(ApiError::Network("connection reset".into()).is_retryable());
        assert!(ApiError::from_status(status(502), "").is_retryable());
        assert!(!ApiError::from_status(status(422), "").is_retryable());
        assert!(!ApiError::Conflict(String::new()).is_retryable());
    }

    #[test]
    fn test_error_envelope_is_unwrapped() {
        assert_eq!(
            ApiError::from_status(status(400), r#"{"error": "No message provided"}"#),
            ApiError::Client {
                status: 400,
                body: "No message provided".into()
            }
        );
        assert_eq!(
            ApiError::from_status(status(500), r#"{"error": "Upstream request failed: timeout"}"#),
            ApiError::Server {
                status: 500,
                body: "Upstream request failed: timeout".into()
            }
        );
    }

    #[test]
    fn test_non_envelope_body_kept_raw() {
        assert_eq!(ApiError::error_message("<html>Bad Gateway</html>"), "<html>Bad Gateway</html>");
        assert_eq!(ApiError::error_message(r#"{"detail": "nope"}"#), r#"{"detail": "nope"}"#);
        assert_eq!(ApiError::error_message(""), "");
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(MAX_ERROR_BODY_LENGTH + 10);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(truncated.contains("510 total bytes"));
        assert_eq!(ApiError::truncate_body("short"), "short");
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_BODY_LENGTH);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.contains("truncated"));
    }
}
