//! Runtime configuration: defaults, environment overrides, optional TOML file.

use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ChatError;

/// Fallback user id sent in the `x-dev-user` header when no identity has been
/// resolved yet.
pub const DEFAULT_DEV_USER: &str = "dev-user";

/// Settings for the backend API client, the handshake, and local state.
///
/// Resolution order is defaults → TOML file (CLI only) → `LMS_CHAT_*`
/// environment variables → explicit flags; later layers win.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Base URL of the Backend Chat API, no trailing slash (e.g. `http://host/api`).
    pub api_base_url: String,
    /// User id sent in `x-dev-user` when the identity store is empty.
    pub default_user: String,
    /// Course identifier sent when starting a conversation.
    pub course_external_id: String,
    /// Language hint forwarded with every chat request.
    pub language: String,
    /// Prefix for cross-frame message types (`<ns>_moodle_user` etc.).
    pub namespace: String,
    /// Development mode: synthesize an identity instead of denying access.
    pub dev_mode: bool,
    /// Bearer token for the plain single-shot send path.
    pub bearer_token: Option<String>,
    /// Path of the durable JSON state file (identity + tombstones).
    pub state_file: String,
    /// Bound on the embedding-token validation call.
    pub handshake_timeout: Duration,
    /// Bound on the stored-history listing call.
    pub history_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        ChatConfig {
            api_base_url: "http://localhost:8000/api".to_string(),
            default_user: DEFAULT_DEV_USER.to_string(),
            course_external_id: "pilot-course".to_string(),
            language: "en".to_string(),
            namespace: "lms".to_string(),
            dev_mode: false,
            bearer_token: None,
            state_file: "lms-chat-state.json".to_string(),
            handshake_timeout: Duration::from_secs(10),
            history_timeout: Duration::from_secs(15),
        }
    }
}

/// On-disk layout of the optional CLI config file. Every field is optional;
/// absent fields keep their current value.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub api_base_url: Option<String>,
    pub default_user: Option<String>,
    pub course_external_id: Option<String>,
    pub language: Option<String>,
    pub namespace: Option<String>,
    pub dev_mode: Option<bool>,
    pub bearer_token: Option<String>,
    pub state_file: Option<String>,
}

impl ChatConfig {
    /// Defaults overlaid with `LMS_CHAT_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = ChatConfig::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("LMS_CHAT_API_BASE") {
            self.api_base_url = v.trim_end_matches('/').to_string();
        }
        if let Ok(v) = env::var("LMS_CHAT_USER") {
            self.default_user = v;
        }
        if let Ok(v) = env::var("LMS_CHAT_COURSE") {
            self.course_external_id = v;
        }
        if let Ok(v) = env::var("LMS_CHAT_LANGUAGE") {
            self.language = v;
        }
        if let Ok(v) = env::var("LMS_CHAT_NAMESPACE") {
            self.namespace = v;
        }
        if let Ok(v) = env::var("LMS_CHAT_DEV") {
            self.dev_mode = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = env::var("LMS_CHAT_BEARER") {
            self.bearer_token = Some(v);
        }
        if let Ok(v) = env::var("LMS_CHAT_STATE_FILE") {
            self.state_file = v;
        }
    }

    /// Overlay settings from a TOML file.
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ChatError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ChatError::Storage {
            tier: "config".to_string(),
            reason: e.to_string(),
        })?;
        let file: ConfigFile = toml::from_str(&raw).map_err(|e| ChatError::Storage {
            tier: "config".to_string(),
            reason: e.to_string(),
        })?;
        self.apply_overrides(file);
        Ok(())
    }

    pub fn apply_overrides(&mut self, file: ConfigFile) {
        if let Some(v) = file.api_base_url {
            self.api_base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = file.default_user {
            self.default_user = v;
        }
        if let Some(v) = file.course_external_id {
            self.course_external_id = v;
        }
        if let Some(v) = file.language {
            self.language = v;
        }
        if let Some(v) = file.namespace {
            self.namespace = v;
        }
        if let Some(v) = file.dev_mode {
            self.dev_mode = v;
        }
        if let Some(v) = file.bearer_token {
            self.bearer_token = Some(v);
        }
        if let Some(v) = file.state_file {
            self.state_file = v;
        }
    }
}
