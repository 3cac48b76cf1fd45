use thiserror::Error;

/// Crate-level error type. Transport and decode failures that have a local
/// fallback are handled at the call site and never reach the caller as a
/// `ChatError`; everything here is a failure with no remaining fallback.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("session validation failed: {0}")]
    Validation(String),

    #[error("session validation timed out after {0}s")]
    Timeout(u64),

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("storage tier '{tier}' failed: {reason}")]
    Storage { tier: String, reason: String },

    #[error("a reply is already pending for this session")]
    SubmitPending,
}

impl ChatError {
    /// True when the failure points at a server-side fault (HTTP 5xx), which
    /// gets distinct user-facing wording.
    pub fn is_server_fault(&self) -> bool {
        match self {
            ChatError::Status { status, .. } => (500..600).contains(status),
            ChatError::Transport(e) => e
                .status()
                .map(|s| s.is_server_error())
                .unwrap_or(false),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_500_is_server_fault() {
        let err = ChatError::Status { status: 500, body: "boom".to_string() };
        assert!(err.is_server_fault());
    }

    #[test]
    fn test_status_503_is_server_fault() {
        let err = ChatError::Status { status: 503, body: String::new() };
        assert!(err.is_server_fault());
    }

    #[test]
    fn test_status_404_is_not_server_fault() {
        let err = ChatError::Status { status: 404, body: String::new() };
        assert!(!err.is_server_fault());
    }

    #[test]
    fn test_validation_is_not_server_fault() {
        assert!(!ChatError::Validation("invalid_session".to_string()).is_server_fault());
    }

    #[test]
    fn test_timeout_display_mentions_seconds() {
        let err = ChatError::Timeout(10);
        assert!(err.to_string().contains("10s"));
    }

    #[test]
    fn test_status_display_contains_code_and_body() {
        let err = ChatError::Status { status: 422, body: "bad feedback".to_string() };
        let text = err.to_string();
        assert!(text.contains("422"));
        assert!(text.contains("bad feedback"));
    }

    #[test]
    fn test_storage_display_names_tier() {
        let err = ChatError::Storage { tier: "durable".to_string(), reason: "disk full".to_string() };
        assert!(err.to_string().contains("durable"));
    }
}
