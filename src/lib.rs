pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod handshake;
pub mod history;
pub mod identity;
pub mod stream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use api::{ChatApi, ChatResponse, FeedbackRating};
use config::ChatConfig;
use error::ChatError;
use identity::IdentityStore;
use stream::{Citation, MediaItem, StreamUpdate};

// ---------------------------------------------------------------------------
// Apology texts
// ---------------------------------------------------------------------------

/// Shown when a turn fails for an unknown reason.
pub const GENERIC_FAILURE_TEXT: &str =
    "Sorry, something went wrong while answering. Please try again.";

/// Shown when the backend itself reported a fault (5xx), which usually means
/// retrying later is the only option.
pub const SERVER_FAULT_TEXT: &str = "Sorry, the assistant service is currently unavailable.\n\
     Your message was not lost; please try sending it again in a moment.";

// ---------------------------------------------------------------------------
// Transcript types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One transcript entry. Assistant entries start as a streaming placeholder
/// and are finalized in place as updates arrive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: usize,
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Citation>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_streaming: bool,
    /// Stable id sent with feedback, distinct from the transcript index.
    pub message_id: String,
}

// ---------------------------------------------------------------------------
// ChatEngine — one conversation's state machine
// ---------------------------------------------------------------------------

/// Owns the transcript of one conversation and drives submissions through
/// the backend: direct answers when the response carries text inline,
/// otherwise the answer stream folded into the placeholder message.
pub struct ChatEngine {
    api: ChatApi,
    config: ChatConfig,
    messages: Vec<Message>,
    session_id: Option<String>,
    pending: bool,
    next_id: usize,
    /// Optional tap: every stream update is mirrored here for live display.
    update_tap: Option<mpsc::UnboundedSender<StreamUpdate>>,
}

impl ChatEngine {
    pub fn new(config: ChatConfig, store: IdentityStore) -> ChatEngine {
        let api = ChatApi::new(config.clone(), store);
        ChatEngine {
            api,
            config,
            messages: Vec::new(),
            session_id: None,
            pending: false,
            next_id: 0,
            update_tap: None,
        }
    }

    pub fn api(&self) -> &ChatApi {
        &self.api
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn set_update_tap(&mut self, tap: mpsc::UnboundedSender<StreamUpdate>) {
        self.update_tap = Some(tap);
    }

    // -- submission ----------------------------------------------------------

    /// Submit one user message. At most one submission may be in flight;
    /// a second one is rejected rather than queued. Turn failures are
    /// recorded as an apology in the transcript and are not errors here.
    pub async fn submit(&mut self, text: &str) -> Result<(), ChatError> {
        if self.pending {
            return Err(ChatError::SubmitPending);
        }
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.pending = true;
        let result = self.run_turn(text).await;
        self.pending = false;
        result
    }

    async fn run_turn(&mut self, text: &str) -> Result<(), ChatError> {
        self.push_message(Role::User, text.to_string(), false, "user-msg");
        let placeholder = self.push_message(Role::Assistant, String::new(), true, "ai-msg");

        let sent = match &self.session_id {
            Some(session_id) => self.api.send_message(session_id, text).await,
            None => self.api.start_chat(text).await,
        };
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                self.fail_message(placeholder, &e);
                return Ok(());
            }
        };

        if let Some(session_id) = &response.session_id {
            self.session_id = Some(session_id.clone());
        }

        // inline answer, no stream needed
        if let Some(answer) = response.answer_text() {
            let total = answer.to_string();
            self.apply_update(placeholder, StreamUpdate::Complete { total });
            return Ok(());
        }

        let Some(session_id) = self.session_id.clone() else {
            warn!("response carried neither an answer nor a session id");
            self.fail_message(placeholder, &ChatError::Validation("no session".to_string()));
            return Ok(());
        };
        self.stream_turn(placeholder, session_id, response).await;
        Ok(())
    }

    async fn stream_turn(&mut self, placeholder: usize, session_id: String, response: ChatResponse) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let api = self.api.clone();
        let stream_url = response.stream_url.clone();
        let worker = tokio::spawn(async move {
            api.stream_reply(&session_id, stream_url.as_deref(), &tx).await
        });

        while let Some(update) = rx.recv().await {
            self.apply_update(placeholder, update);
        }

        match worker.await {
            Ok(Ok(_)) => {
                // a stream can close without a terminator; the reducer has
                // already emitted Complete in that case
            }
            Ok(Err(e)) => self.fail_message(placeholder, &e),
            Err(e) => {
                warn!(error = %e, "stream worker panicked");
                self.fail_message(placeholder, &ChatError::Validation(e.to_string()));
            }
        }
    }

    /// Fold one stream update into a transcript entry, mirroring it to the
    /// tap. Finalized entries are never reopened.
    fn apply_update(&mut self, id: usize, update: StreamUpdate) {
        if let Some(tap) = &self.update_tap {
            let _ = tap.send(update.clone());
        }
        let Some(message) = self.messages.iter_mut().find(|m| m.id == id) else {
            return;
        };
        if !message.is_streaming {
            return;
        }
        match update {
            StreamUpdate::Fragment { total, .. } => message.text = total,
            StreamUpdate::Sources(citations) => message.references = citations,
            StreamUpdate::Media(media) => message.media = media,
            StreamUpdate::Complete { total } => {
                if !total.is_empty() {
                    message.text = total;
                }
                message.is_streaming = false;
            }
            StreamUpdate::Failed { message: apology } => {
                message.text = apology;
                message.is_streaming = false;
            }
        }
    }

    /// Replace a still-streaming entry with an apology matched to the
    /// failure class. Routed through `apply_update` so the tap sees a
    /// terminal update too and observers can close out the turn.
    fn fail_message(&mut self, id: usize, error: &ChatError) {
        warn!(error = %error, "turn failed");
        let apology = if error.is_server_fault() {
            SERVER_FAULT_TEXT
        } else {
            GENERIC_FAILURE_TEXT
        };
        self.apply_update(
            id,
            StreamUpdate::Failed {
                message: apology.to_string(),
            },
        );
    }

    fn push_message(&mut self, role: Role, text: String, streaming: bool, id_prefix: &str) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.messages.push(Message {
            id,
            role,
            text,
            media: Vec::new(),
            references: Vec::new(),
            timestamp: Utc::now(),
            is_streaming: streaming,
            message_id: format!("{}-{}", id_prefix, Uuid::new_v4()),
        });
        id
    }

    // -- conversation management --------------------------------------------

    pub fn new_chat(&mut self) {
        self.messages.clear();
        self.session_id = None;
        self.pending = false;
    }

    /// Load a stored conversation into the transcript, replacing it.
    pub async fn load_session(&mut self, session_id: &str) -> Result<(), ChatError> {
        let conversation = self.api.load_chat(session_id).await?;
        self.messages.clear();
        self.next_id = 0;
        for stored in &conversation.messages {
            let role = if stored.is_assistant() {
                Role::Assistant
            } else {
                Role::User
            };
            let prefix = match role {
                Role::User => "user-msg",
                Role::Assistant => "ai-msg",
            };
            let body = stored.body().unwrap_or_default().to_string();
            self.push_message(role, body, false, prefix);
        }
        self.session_id = Some(session_id.to_string());
        self.pending = false;
        info!(session_id, count = self.messages.len(), "conversation loaded");
        Ok(())
    }

    pub async fn rename(&self, title: &str) -> Result<(), ChatError> {
        match &self.session_id {
            Some(session_id) => self.api.rename_chat(session_id, title).await,
            None => Ok(()),
        }
    }

    /// Best-effort save of the current conversation's title.
    pub async fn save(&self, title: &str) -> bool {
        match &self.session_id {
            Some(session_id) => self.api.save_chat(session_id, title).await,
            None => false,
        }
    }

    /// Send feedback for one assistant message. Backends reject sessions
    /// whose id is not a UUID; such ids are regenerated once and kept.
    pub async fn feedback(
        &mut self,
        message_id: &str,
        rating: FeedbackRating,
        comment: &str,
    ) -> Result<(), ChatError> {
        let Some(session_id) = self.session_id.clone() else {
            return Err(ChatError::Validation("no active session".to_string()));
        };
        let session_id = if Uuid::parse_str(&session_id).is_ok() {
            session_id
        } else {
            let regenerated = Uuid::new_v4().to_string();
            warn!(old = %session_id, new = %regenerated, "session id is not a uuid, regenerating");
            self.session_id = Some(regenerated.clone());
            regenerated
        };
        self.api
            .send_feedback(&session_id, message_id, rating, comment)
            .await
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }
}
