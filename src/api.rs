//! HTTP client for the Backend Chat API: conversation lifecycle, the answer
//! stream (with its stored-history fallback), history CRUD, and feedback.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use url::Url;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::identity::{IdentityStore, UserIdentity};
use crate::stream::{StreamReducer, StreamUpdate};

/// Per-request header carrying the resolved user id.
pub const USER_HEADER: &str = "x-dev-user";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StartChatRequest {
    pub message: String,
    pub course_external_id: String,
    pub language: String,
}

#[derive(Debug, Serialize)]
pub struct ContinueChatRequest {
    pub message: String,
    pub language: String,
}

/// Response of both the start and continue endpoints. The backend answers
/// either inline (one of several text keys) or with a stream handle.
#[derive(Debug, Default, Deserialize)]
pub struct ChatResponse {
    pub session_id: Option<String>,
    pub response: Option<String>,
    pub message: Option<String>,
    pub answer: Option<String>,
    pub text: Option<String>,
    pub stream_url: Option<String>,
}

impl ChatResponse {
    /// First present of the alternate answer keys.
    pub fn answer_text(&self) -> Option<&str> {
        [&self.response, &self.message, &self.answer, &self.text]
            .into_iter()
            .find_map(|field| field.as_deref())
    }
}

#[derive(Debug, Serialize)]
pub struct SessionHandshakeRequest {
    pub moodle_session_token: String,
    pub origin: String,
    pub page: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionHandshakeResponse {
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub valid: Option<bool>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    pub error: Option<String>,
}

impl SessionHandshakeResponse {
    pub fn accepted(&self) -> bool {
        self.ok.or(self.valid).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackRating {
    Positive,
    Negative,
}

impl std::fmt::Display for FeedbackRating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedbackRating::Positive => write!(f, "positive"),
            FeedbackRating::Negative => write!(f, "negative"),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FeedbackRequest {
    pub session_id: String,
    pub message_id: String,
    pub rating: String,
    pub comment: String,
}

/// One stored conversation, as returned by the history detail endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct StoredConversation {
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StoredMessage {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub sender: Option<String>,
    pub text: Option<String>,
    pub content: Option<String>,
    pub message: Option<String>,
}

impl StoredMessage {
    pub fn is_assistant(&self) -> bool {
        matches!(self.kind.as_deref(), Some("ai") | Some("assistant"))
            || self.sender.as_deref() == Some("ai")
    }

    pub fn body(&self) -> Option<&str> {
        [&self.text, &self.content, &self.message]
            .into_iter()
            .find_map(|field| field.as_deref())
    }
}

impl StoredConversation {
    /// Text of the last assistant entry, if any.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_assistant())
            .and_then(|m| m.body())
            .filter(|body| !body.is_empty())
            .map(str::to_string)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Thin reqwest wrapper. Every request carries the `x-dev-user` header with
/// the currently resolved user id, falling back to the configured default.
#[derive(Clone)]
pub struct ChatApi {
    client: Client,
    config: ChatConfig,
    store: IdentityStore,
}

impl ChatApi {
    pub fn new(config: ChatConfig, store: IdentityStore) -> ChatApi {
        ChatApi {
            client: Client::new(),
            config,
            store,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    fn user_header(&self) -> String {
        self.store
            .read()
            .and_then(|identity| identity.user_id)
            .unwrap_or_else(|| self.config.default_user.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base_url, path)
    }

    async fn status_error(response: reqwest::Response) -> ChatError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ChatError::Status { status, body }
    }

    // -- handshake ----------------------------------------------------------

    /// Validate an embedding token against the backend. On acceptance the
    /// response fields become a host-sourced identity.
    pub async fn validate_session(
        &self,
        token: &str,
        origin: &str,
        page: &str,
    ) -> Result<UserIdentity, ChatError> {
        info!("validating embedding session");
        let request = SessionHandshakeRequest {
            moodle_session_token: token.to_string(),
            origin: origin.to_string(),
            page: page.to_string(),
        };
        let response = self
            .client
            .post(self.url("/moodle/session/handshake"))
            .json(&request)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ChatError::Validation("invalid_session".to_string()));
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let data: SessionHandshakeResponse = response.json().await?;
        if !data.accepted() {
            return Err(ChatError::Validation(
                data.error.unwrap_or_else(|| "invalid_session".to_string()),
            ));
        }
        let identity = UserIdentity {
            user_id: data.user_id,
            user_name: data.user_name,
            user_email: data.user_email,
            from_host: true,
        };
        if !identity.is_identified() {
            return Err(ChatError::Validation("empty identity".to_string()));
        }
        info!(user = ?identity.user_id, "embedding session accepted");
        Ok(identity)
    }

    // -- conversation lifecycle ---------------------------------------------

    /// Start a new conversation.
    pub async fn start_chat(&self, message: &str) -> Result<ChatResponse, ChatError> {
        let request = StartChatRequest {
            message: message.to_string(),
            course_external_id: self.config.course_external_id.clone(),
            language: self.config.language.clone(),
        };
        let response = self
            .client
            .post(self.url("/chat"))
            .header(USER_HEADER, self.user_header())
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Send a message into an existing conversation.
    pub async fn send_message(
        &self,
        session_id: &str,
        message: &str,
    ) -> Result<ChatResponse, ChatError> {
        let request = ContinueChatRequest {
            message: message.to_string(),
            language: self.config.language.clone(),
        };
        let response = self
            .client
            .post(self.url(&format!("/chat/{}/message", session_id)))
            .header(USER_HEADER, self.user_header())
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Single-shot send path with bearer auth. Not part of the main flow.
    pub async fn send_query(&self, message: &str) -> Result<Value, ChatError> {
        let mut request = self
            .client
            .post(self.url("/chat"))
            .header(USER_HEADER, self.user_header())
            .json(&serde_json::json!({ "query": message }));
        if let Some(token) = &self.config.bearer_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(response.json().await?)
    }

    // -- streaming ----------------------------------------------------------

    /// Resolve the stream handle: absolute URLs pass through, `/api/...`
    /// paths are joined onto the host root, bare paths onto the API base,
    /// and no handle at all falls back to the default per-session path.
    pub fn resolve_stream_url(&self, session_id: &str, stream_url: Option<&str>) -> String {
        match stream_url {
            Some(handle) if handle.starts_with("http") => handle.to_string(),
            Some(handle) if handle.starts_with("/api/") => {
                let root = self
                    .config
                    .api_base_url
                    .trim_end_matches('/')
                    .trim_end_matches("/api");
                format!("{}{}", root, handle)
            }
            Some(handle) => self.url(handle),
            None => self.url(&format!("/chat/stream/{}", session_id)),
        }
    }

    /// Consume the answer stream for a session, emitting progress through
    /// `updates` and returning the final accumulated text.
    ///
    /// A 404 on open means the backend has no stream endpoint; the stored
    /// conversation is fetched instead and its last assistant entry becomes
    /// the completed answer. Any other failure aborts without finalizing.
    pub async fn stream_reply(
        &self,
        session_id: &str,
        stream_url: Option<&str>,
        updates: &mpsc::UnboundedSender<StreamUpdate>,
    ) -> Result<String, ChatError> {
        let url = self.resolve_stream_url(session_id, stream_url);
        info!(%url, "opening answer stream");

        let response = self
            .client
            .get(&url)
            .header(USER_HEADER, self.user_header())
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("stream endpoint missing, trying stored conversation");
            match self.load_chat(session_id).await {
                Ok(conversation) => {
                    if let Some(text) = conversation.last_assistant_text() {
                        let _ = updates.send(StreamUpdate::Complete { total: text.clone() });
                        return Ok(text);
                    }
                }
                Err(e) => warn!(error = %e, "stored-conversation fallback failed"),
            }
            return Err(ChatError::Status {
                status: 404,
                body: "no stream endpoint and no stored reply".to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let mut reducer = StreamReducer::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for update in reducer.push(&chunk) {
                let done = matches!(update, StreamUpdate::Complete { .. });
                let _ = updates.send(update);
                if done {
                    return Ok(reducer.total().to_string());
                }
            }
        }
        if let Some(update) = reducer.finish() {
            let _ = updates.send(update);
        }
        Ok(reducer.total().to_string())
    }

    // -- history ------------------------------------------------------------

    /// Stored-history listing. Timeouts, network failures, a missing
    /// endpoint, and non-array bodies all degrade to an empty list so the
    /// sidebar never breaks the page.
    pub async fn history(&self) -> Result<Vec<Value>, ChatError> {
        let request = self
            .client
            .get(self.url("/chat/history"))
            .header(USER_HEADER, self.user_header())
            .send();

        let response = match tokio::time::timeout(self.config.history_timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(error = %e, "history fetch failed, returning empty list");
                return Ok(Vec::new());
            }
            Err(_) => {
                warn!("history fetch timed out, returning empty list");
                return Ok(Vec::new());
            }
        };

        if response.status() == StatusCode::NOT_FOUND {
            debug!("history endpoint missing, returning empty list");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let data: Value = response.json().await?;
        match data {
            Value::Array(entries) => Ok(entries),
            _ => Ok(Vec::new()),
        }
    }

    /// Fetch one stored conversation.
    pub async fn load_chat(&self, session_id: &str) -> Result<StoredConversation, ChatError> {
        let response = self
            .client
            .get(self.url(&format!("/chat/history/{}", session_id)))
            .header(USER_HEADER, self.user_header())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Rename a stored conversation.
    pub async fn rename_chat(&self, session_id: &str, title: &str) -> Result<(), ChatError> {
        let response = self
            .client
            .patch(self.url(&format!("/chat/{}/title", session_id)))
            .header(USER_HEADER, self.user_header())
            .json(&serde_json::json!({ "title": title }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(())
    }

    fn save_url(&self, session_id: &str, title: &str) -> Result<Url, ChatError> {
        let mut url = Url::parse(&self.url("/chat/history"))?;
        url.query_pairs_mut()
            .append_pair("session_id", session_id)
            .append_pair("title", title);
        Ok(url)
    }

    /// Best-effort save. Saving is optional; failures are logged and reported
    /// as `false`, never raised.
    pub async fn save_chat(&self, session_id: &str, title: &str) -> bool {
        let url = match self.save_url(session_id, title) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, "save failed");
                return false;
            }
        };
        match self
            .client
            .get(url)
            .header(USER_HEADER, self.user_header())
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                debug!("save endpoint not implemented");
                false
            }
            Ok(response) => {
                warn!(status = response.status().as_u16(), "save failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "save failed");
                false
            }
        }
    }

    /// Submit a rating for one assistant message.
    pub async fn send_feedback(
        &self,
        session_id: &str,
        message_id: &str,
        rating: FeedbackRating,
        comment: &str,
    ) -> Result<(), ChatError> {
        let request = FeedbackRequest {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            rating: rating.to_string(),
            comment: comment.to_string(),
        };
        let response = self
            .client
            .post(self.url("/chat/feedback"))
            .header(USER_HEADER, self.user_header())
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(())
    }

    /// Delete a stored conversation. The backend's delete surface has shifted
    /// over time, so several endpoint shapes are tried; any 2xx wins.
    pub async fn delete_chat(&self, session_id: &str) -> Result<(), ChatError> {
        let endpoints = [
            self.url(&format!("/chat/{}", session_id)),
            self.url(&format!("/chat/history/{}", session_id)),
            self.url(&format!("/chat/{}/delete", session_id)),
        ];

        let mut last_error = None;
        for endpoint in endpoints {
            match self
                .client
                .delete(&endpoint)
                .header(USER_HEADER, self.config.default_user.clone())
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    info!(%endpoint, "conversation deleted");
                    return Ok(());
                }
                Ok(response) => {
                    debug!(%endpoint, status = response.status().as_u16(), "delete rejected");
                    last_error = Some(Self::status_error(response).await);
                }
                Err(e) => {
                    debug!(%endpoint, error = %e, "delete failed");
                    last_error = Some(ChatError::Transport(e));
                }
            }
        }
        Err(last_error.unwrap_or(ChatError::Status {
            status: 404,
            body: "no delete endpoint available".to_string(),
        }))
    }
}
