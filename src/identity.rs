//! User identity: the canonical record, field-name normalization, and the
//! three-tier store (shared slot, durable storage, session storage).
//!
//! ## Design
//! - Identity may arrive from the embedding host, from token validation, or
//!   from a previous page session; every source spells the fields differently.
//!   Normalization happens on every read — nothing downstream ever branches on
//!   raw payload shape.
//! - The shared slot is process-wide state (an embedding ancestor may have
//!   filled it before this widget ran). Writes are last-writer-wins.
//! - Tier writes are best-effort: a failing tier is logged and skipped, and
//!   identity keeps working from whichever tier accepted the write.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::ChatError;

/// Storage key for the canonical identity record in every tier.
pub const IDENTITY_KEY: &str = "moodle_user";

/// User id of the synthetic guest identity.
pub const GUEST_USER_ID: &str = "guest";

/// Process-wide identity slot, shared with an embedding ancestor.
static SHARED_IDENTITY: Lazy<Arc<Mutex<Option<UserIdentity>>>> =
    Lazy::new(|| Arc::new(Mutex::new(None)));

// ---------------------------------------------------------------------------
// Canonical identity record
// ---------------------------------------------------------------------------

/// The normalized user record. A record is "identified" when at least one of
/// id, name, or email is present; anything else is discarded, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub user_email: Option<String>,
    /// True when the record came from the embedding host (token validation or
    /// frame push) rather than a local guest/dev default.
    #[serde(default)]
    pub from_host: bool,
}

/// Pull the first non-empty string out of `value` under any of `keys`.
fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = value.get(*key).and_then(Value::as_str) {
            if !s.trim().is_empty() {
                return Some(s.to_string());
            }
        }
    }
    None
}

fn first_bool(value: &Value, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|key| value.get(*key).and_then(Value::as_bool))
}

impl UserIdentity {
    /// Normalize a heterogeneous JSON object into the canonical shape.
    ///
    /// Returns `None` when the payload is not an object or fails the
    /// "identified" invariant.
    pub fn normalize(value: &Value) -> Option<UserIdentity> {
        if !value.is_object() {
            return None;
        }
        let identity = UserIdentity {
            user_id: first_string(value, &["userId", "userid", "user_id", "id"]),
            user_name: first_string(
                value,
                &["userName", "username", "user_name", "name", "fullname"],
            ),
            user_email: first_string(
                value,
                &["userEmail", "useremail", "user_email", "email"],
            ),
            from_host: first_bool(
                value,
                &["fromHost", "from_host", "fromMoodle", "from_moodle"],
            )
            .unwrap_or(false),
        };
        identity.is_identified().then_some(identity)
    }

    /// At least one identifying field is present.
    pub fn is_identified(&self) -> bool {
        self.user_id.is_some() || self.user_name.is_some() || self.user_email.is_some()
    }

    /// Guest and dev records never came from the host.
    pub fn is_guest(&self) -> bool {
        self.user_id.as_deref() == Some(GUEST_USER_ID) || !self.from_host
    }

    /// Synthetic identity for a top-level page with no host and no token.
    pub fn guest() -> UserIdentity {
        UserIdentity {
            user_id: Some(GUEST_USER_ID.to_string()),
            user_name: Some("Visitor".to_string()),
            user_email: None,
            from_host: false,
        }
    }

    /// Synthetic identity for development mode.
    pub fn dev() -> UserIdentity {
        UserIdentity {
            user_id: Some("dev-user".to_string()),
            user_name: Some("Developer".to_string()),
            user_email: None,
            from_host: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Storage tiers
// ---------------------------------------------------------------------------

/// One key-value persistence tier. Implementations must tolerate concurrent
/// use; failures are reported, the store decides whether they matter.
pub trait StorageTier: Send + Sync {
    fn name(&self) -> &str;
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str) -> Result<(), ChatError>;
    fn remove(&self, key: &str);
}

/// Session-scoped tier: lives as long as the process, lost on restart.
pub struct MemoryTier {
    name: String,
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryTier {
    pub fn new(name: &str) -> MemoryTier {
        MemoryTier {
            name: name.to_string(),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl StorageTier for MemoryTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), ChatError> {
        let mut guard = self.entries.lock().map_err(|_| ChatError::Storage {
            tier: self.name.clone(),
            reason: "lock poisoned".to_string(),
        })?;
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.remove(key);
        }
    }
}

/// Durable tier: a flat JSON object on disk, read fresh on every access so a
/// concurrent writer in another process is picked up.
pub struct JsonFileTier {
    path: PathBuf,
}

impl JsonFileTier {
    pub fn new(path: impl Into<PathBuf>) -> JsonFileTier {
        JsonFileTier { path: path.into() }
    }

    fn load_map(&self) -> HashMap<String, String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn store_map(&self, map: &HashMap<String, String>) -> Result<(), ChatError> {
        let raw = serde_json::to_string(map)?;
        std::fs::write(&self.path, raw).map_err(|e| ChatError::Storage {
            tier: "durable".to_string(),
            reason: e.to_string(),
        })
    }
}

impl StorageTier for JsonFileTier {
    fn name(&self) -> &str {
        "durable"
    }

    fn get(&self, key: &str) -> Option<String> {
        self.load_map().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), ChatError> {
        let mut map = self.load_map();
        map.insert(key.to_string(), value.to_string());
        self.store_map(&map)
    }

    fn remove(&self, key: &str) {
        let mut map = self.load_map();
        if map.remove(key).is_some() {
            let _ = self.store_map(&map);
        }
    }
}

// ---------------------------------------------------------------------------
// IdentityStore
// ---------------------------------------------------------------------------

/// Multi-tier identity store with change notification.
#[derive(Clone)]
pub struct IdentityStore {
    slot: Arc<Mutex<Option<UserIdentity>>>,
    durable: Arc<dyn StorageTier>,
    session: Arc<dyn StorageTier>,
    events: broadcast::Sender<UserIdentity>,
}

impl IdentityStore {
    /// Store backed by the process-wide shared slot.
    pub fn new(durable: Arc<dyn StorageTier>, session: Arc<dyn StorageTier>) -> IdentityStore {
        Self::with_slot(SHARED_IDENTITY.clone(), durable, session)
    }

    /// Store with a private slot. Tests use this to stay isolated from the
    /// process-wide state.
    pub fn with_slot(
        slot: Arc<Mutex<Option<UserIdentity>>>,
        durable: Arc<dyn StorageTier>,
        session: Arc<dyn StorageTier>,
    ) -> IdentityStore {
        let (events, _) = broadcast::channel(16);
        IdentityStore { slot, durable, session, events }
    }

    /// In-memory store for tests and ephemeral embeddings.
    pub fn ephemeral() -> IdentityStore {
        Self::with_slot(
            Arc::new(Mutex::new(None)),
            Arc::new(MemoryTier::new("durable")),
            Arc::new(MemoryTier::new("session")),
        )
    }

    /// Subscribe to identity-changed notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<UserIdentity> {
        self.events.subscribe()
    }

    /// The durable tier, shared with other persistent records.
    pub fn durable_tier(&self) -> Arc<dyn StorageTier> {
        self.durable.clone()
    }

    /// Read the current identity: slot first, then durable, then session.
    /// The first identified record wins and is back-filled into the other
    /// tiers so they agree again.
    pub fn read(&self) -> Option<UserIdentity> {
        if let Some(identity) = self.slot.lock().ok().and_then(|g| g.clone()) {
            if identity.is_identified() {
                self.backfill(&identity);
                return Some(identity);
            }
        }
        for tier in [&self.durable, &self.session] {
            if let Some(identity) = tier
                .get(IDENTITY_KEY)
                .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
                .as_ref()
                .and_then(UserIdentity::normalize)
            {
                self.set_slot(&identity);
                self.backfill(&identity);
                return Some(identity);
            }
        }
        None
    }

    /// Persist an identity to every tier and notify subscribers. Records that
    /// fail the "identified" invariant are dropped.
    pub fn write(&self, identity: &UserIdentity) {
        if !identity.is_identified() {
            warn!("discarding unidentified record");
            return;
        }
        self.set_slot(identity);
        self.backfill(identity);
        let _ = self.events.send(identity.clone());
    }

    /// Remove the identity from every tier.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.slot.lock() {
            *guard = None;
        }
        self.durable.remove(IDENTITY_KEY);
        self.session.remove(IDENTITY_KEY);
    }

    fn set_slot(&self, identity: &UserIdentity) {
        if let Ok(mut guard) = self.slot.lock() {
            *guard = Some(identity.clone());
        }
    }

    fn backfill(&self, identity: &UserIdentity) {
        let raw = match serde_json::to_string(identity) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "identity serialization failed");
                return;
            }
        };
        for tier in [&self.durable, &self.session] {
            if let Err(e) = tier.put(IDENTITY_KEY, &raw) {
                warn!(tier = tier.name(), error = %e, "identity tier write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(json!({"userId": "u1"}), Some("u1"))]
    #[case(json!({"userid": "u2"}), Some("u2"))]
    #[case(json!({"user_id": "u3"}), Some("u3"))]
    #[case(json!({"id": "u4"}), Some("u4"))]
    #[case(json!({"userName": "Ana"}), None)]
    fn test_normalize_user_id_aliases(#[case] payload: Value, #[case] expected: Option<&str>) {
        let identity = UserIdentity::normalize(&payload).expect("identified");
        assert_eq!(identity.user_id.as_deref(), expected);
    }

    #[rstest]
    #[case(json!({"userName": "Ana"}), "Ana")]
    #[case(json!({"username": "ana"}), "ana")]
    #[case(json!({"user_name": "Ana B"}), "Ana B")]
    #[case(json!({"name": "A. B."}), "A. B.")]
    #[case(json!({"fullname": "Ana Braga"}), "Ana Braga")]
    fn test_normalize_user_name_aliases(#[case] payload: Value, #[case] expected: &str) {
        let identity = UserIdentity::normalize(&payload).expect("identified");
        assert_eq!(identity.user_name.as_deref(), Some(expected));
    }

    #[test]
    fn test_normalize_email_aliases_and_from_host() {
        let identity = UserIdentity::normalize(&json!({
            "user_email": "ana@example.edu",
            "fromMoodle": true
        }))
        .expect("identified");
        assert_eq!(identity.user_email.as_deref(), Some("ana@example.edu"));
        assert!(identity.from_host);
    }

    #[test]
    fn test_normalize_alias_priority_is_left_to_right() {
        let identity = UserIdentity::normalize(&json!({
            "userId": "canonical",
            "id": "fallback"
        }))
        .expect("identified");
        assert_eq!(identity.user_id.as_deref(), Some("canonical"));
    }

    #[test]
    fn test_normalize_rejects_unidentified() {
        assert!(UserIdentity::normalize(&json!({"fromHost": true})).is_none());
        assert!(UserIdentity::normalize(&json!({})).is_none());
        assert!(UserIdentity::normalize(&json!("just a string")).is_none());
        assert!(UserIdentity::normalize(&json!({"userId": "   "})).is_none());
    }

    #[test]
    fn test_guest_is_guest() {
        assert!(UserIdentity::guest().is_guest());
        assert!(UserIdentity::guest().is_identified());
    }

    #[test]
    fn test_host_record_is_not_guest() {
        let identity = UserIdentity {
            user_id: Some("u1".to_string()),
            user_name: None,
            user_email: None,
            from_host: true,
        };
        assert!(!identity.is_guest());
    }

    #[test]
    fn test_local_record_counts_as_guest() {
        // from_host = false means local default, treated as guest-grade
        let identity = UserIdentity {
            user_id: Some("someone".to_string()),
            user_name: None,
            user_email: None,
            from_host: false,
        };
        assert!(identity.is_guest());
    }

    #[test]
    fn test_round_trip_canonical() {
        let identity = UserIdentity {
            user_id: Some("u1".to_string()),
            user_name: Some("Ana".to_string()),
            user_email: None,
            from_host: true,
        };
        let raw = serde_json::to_string(&identity).expect("serialize");
        let back: UserIdentity = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back, identity);
        // canonical form is stable byte-for-byte
        assert_eq!(serde_json::to_string(&back).expect("serialize"), raw);
    }

    #[test]
    fn test_store_write_then_read() {
        let store = IdentityStore::ephemeral();
        let identity = UserIdentity {
            user_id: Some("u9".to_string()),
            user_name: Some("Nine".to_string()),
            user_email: None,
            from_host: true,
        };
        store.write(&identity);
        assert_eq!(store.read(), Some(identity));
    }

    #[test]
    fn test_store_discards_unidentified_write() {
        let store = IdentityStore::ephemeral();
        store.write(&UserIdentity {
            user_id: None,
            user_name: None,
            user_email: None,
            from_host: true,
        });
        assert!(store.read().is_none());
    }

    #[test]
    fn test_store_clear_removes_all_tiers() {
        let store = IdentityStore::ephemeral();
        store.write(&UserIdentity::guest());
        store.clear();
        assert!(store.read().is_none());
    }

    #[test]
    fn test_read_normalizes_legacy_tier_payload() {
        // A tier written by an older embedding may hold host-shaped keys.
        let durable = Arc::new(MemoryTier::new("durable"));
        durable
            .put(IDENTITY_KEY, r#"{"userid":"legacy","fullname":"Old Shape"}"#)
            .expect("put");
        let store = IdentityStore::with_slot(
            Arc::new(Mutex::new(None)),
            durable,
            Arc::new(MemoryTier::new("session")),
        );
        let identity = store.read().expect("identified");
        assert_eq!(identity.user_id.as_deref(), Some("legacy"));
        assert_eq!(identity.user_name.as_deref(), Some("Old Shape"));
    }

    #[test]
    fn test_read_backfills_other_tiers() {
        let durable = Arc::new(MemoryTier::new("durable"));
        let session = Arc::new(MemoryTier::new("session"));
        durable
            .put(IDENTITY_KEY, r#"{"user_id":"u1"}"#)
            .expect("put");
        let store = IdentityStore::with_slot(
            Arc::new(Mutex::new(None)),
            durable,
            session.clone(),
        );
        store.read().expect("identified");
        let raw = session.get(IDENTITY_KEY).expect("backfilled");
        let back: UserIdentity = serde_json::from_str(&raw).expect("canonical");
        assert_eq!(back.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_slot_wins_over_tiers() {
        let slot = Arc::new(Mutex::new(Some(UserIdentity {
            user_id: Some("from-slot".to_string()),
            user_name: None,
            user_email: None,
            from_host: true,
        })));
        let durable = Arc::new(MemoryTier::new("durable"));
        durable
            .put(IDENTITY_KEY, r#"{"user_id":"from-durable"}"#)
            .expect("put");
        let store =
            IdentityStore::with_slot(slot, durable, Arc::new(MemoryTier::new("session")));
        assert_eq!(store.read().expect("id").user_id.as_deref(), Some("from-slot"));
    }

    #[test]
    fn test_write_notifies_subscribers() {
        let store = IdentityStore::ephemeral();
        let mut rx = store.subscribe();
        store.write(&UserIdentity::dev());
        let seen = rx.try_recv().expect("notification");
        assert_eq!(seen.user_id.as_deref(), Some("dev-user"));
    }

    #[test]
    fn test_json_file_tier_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tier = JsonFileTier::new(dir.path().join("state.json"));
        tier.put(IDENTITY_KEY, r#"{"user_id":"u1"}"#).expect("put");
        assert_eq!(tier.get(IDENTITY_KEY).as_deref(), Some(r#"{"user_id":"u1"}"#));
        tier.remove(IDENTITY_KEY);
        assert!(tier.get(IDENTITY_KEY).is_none());
    }

    #[test]
    fn test_json_file_tier_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tier = JsonFileTier::new(dir.path().join("absent.json"));
        assert!(tier.get(IDENTITY_KEY).is_none());
    }

    #[test]
    fn test_json_file_tier_two_keys_coexist() {
        let dir = tempfile::tempdir().expect("tempdir");
        let tier = JsonFileTier::new(dir.path().join("state.json"));
        tier.put("a", "1").expect("put");
        tier.put("b", "2").expect("put");
        assert_eq!(tier.get("a").as_deref(), Some("1"));
        assert_eq!(tier.get("b").as_deref(), Some("2"));
    }
}
