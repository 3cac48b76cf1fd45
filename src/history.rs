//! Conversation history listing with local tombstones.
//!
//! Backends have been observed to resurrect deleted conversations, so every
//! delete is recorded locally first and the listing filters tombstoned ids
//! out regardless of what the backend returns. The tombstone set lives in the
//! durable storage tier next to the identity record.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::api::ChatApi;
use crate::identity::StorageTier;

pub const DELETED_CHATS_KEY: &str = "deleted_chats";

/// The id of a history entry, whichever field the backend used for it.
pub fn entry_id(entry: &Value) -> Option<&str> {
    ["id", "session_id", "chat_id"]
        .iter()
        .find_map(|key| entry.get(key).and_then(Value::as_str))
        .filter(|id| !id.is_empty())
}

fn entry_timestamp(entry: &Value) -> Option<DateTime<Utc>> {
    ["updated_at", "created_at"]
        .iter()
        .find_map(|key| entry.get(key).and_then(Value::as_str))
        .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
}

/// True for titles in the shape `Chat DD/MM/YYYY`, the placeholder the
/// backend assigns before anyone names a conversation.
pub fn is_placeholder_title(title: &str) -> bool {
    let Some(rest) = title.strip_prefix("Chat ") else {
        return false;
    };
    let parts: Vec<&str> = rest.split('/').collect();
    parts.len() == 3
        && parts[0].len() == 2
        && parts[1].len() == 2
        && parts[2].len() == 4
        && parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit()))
}

/// Display title for a history entry: an explicit non-placeholder title wins,
/// otherwise fall back to a dated label.
pub fn entry_title(entry: &Value, now: DateTime<Utc>) -> String {
    if let Some(title) = entry.get("title").and_then(Value::as_str) {
        let title = title.trim();
        if !title.is_empty() && !is_placeholder_title(title) {
            return title.to_string();
        }
    }
    format!("Chat {}", now.format("%d/%m/%Y"))
}

// ---------------------------------------------------------------------------

pub struct HistoryView {
    api: ChatApi,
    durable: Arc<dyn StorageTier>,
    tombstones: HashSet<String>,
}

impl HistoryView {
    pub fn new(api: ChatApi, durable: Arc<dyn StorageTier>) -> HistoryView {
        let tombstones = load_tombstones(durable.as_ref());
        HistoryView {
            api,
            durable,
            tombstones,
        }
    }

    pub fn is_deleted(&self, session_id: &str) -> bool {
        self.tombstones.contains(session_id)
    }

    /// Fetch the history list, drop tombstoned entries, newest first.
    /// Degrades to an empty list the same way the underlying fetch does.
    pub async fn refresh(&self) -> Vec<Value> {
        let mut entries: Vec<Value> = self
            .api
            .history()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|entry| {
                entry_id(entry).map_or(true, |id| !self.tombstones.contains(id))
            })
            .collect();
        entries.sort_by_key(|entry| std::cmp::Reverse(entry_timestamp(entry)));
        entries
    }

    /// Delete a conversation. The tombstone is written and persisted before
    /// the backend is asked, so the entry stays gone even when every delete
    /// endpoint fails. Returns whether the backend accepted the delete.
    pub async fn delete(&mut self, session_id: &str) -> bool {
        self.tombstones.insert(session_id.to_string());
        self.persist_tombstones();

        match self.api.delete_chat(session_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id, error = %e, "backend delete failed, tombstone kept");
                false
            }
        }
    }

    pub fn clear_tombstones(&mut self) {
        self.tombstones.clear();
        self.durable.remove(DELETED_CHATS_KEY);
    }

    fn persist_tombstones(&self) {
        let ids: Vec<&String> = self.tombstones.iter().collect();
        match serde_json::to_string(&ids) {
            Ok(serialized) => {
                if let Err(e) = self.durable.put(DELETED_CHATS_KEY, &serialized) {
                    warn!(error = %e, "failed to persist tombstones");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize tombstones"),
        }
    }
}

fn load_tombstones(durable: &dyn StorageTier) -> HashSet<String> {
    let Some(raw) = durable.get(DELETED_CHATS_KEY) else {
        return HashSet::new();
    };
    match serde_json::from_str::<Vec<String>>(&raw) {
        Ok(ids) => ids.into_iter().collect(),
        Err(e) => {
            debug!(error = %e, "discarding unreadable tombstone record");
            HashSet::new()
        }
    }
}
