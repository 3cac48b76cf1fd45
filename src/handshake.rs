//! The identity handshake: who is the user?
//!
//! ## Design
//! Three sources race to answer: a previously stored record, validation of an
//! embedding token from the launch URL, and a push from the host frame. The
//! resolver settles the common cases immediately (steps 1-3), bounds the slow
//! token validation with a timeout, and keeps a standing listener so a late
//! but authoritative host push can still win.
//!
//! Outcome transitions are monotonic from `Loading` toward a terminal state,
//! with exactly one override edge: a host push may turn `Guest` or `Denied`
//! into `Authenticated` at any point in the page's life.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use url::Url;

use crate::api::ChatApi;
use crate::error::ChatError;
use crate::identity::{IdentityStore, UserIdentity};

// ---------------------------------------------------------------------------
// Launch parameters
// ---------------------------------------------------------------------------

/// Query parameters the host puts on the widget URL when launching it.
/// Consumed once, then the token is stripped from the visible URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    pub token: Option<String>,
    pub origin: String,
    pub course_id: Option<String>,
    pub page: String,
}

impl Default for LaunchParams {
    fn default() -> Self {
        LaunchParams {
            token: None,
            origin: "moodle".to_string(),
            course_id: None,
            page: "chat".to_string(),
        }
    }
}

impl LaunchParams {
    pub fn from_url(url: &Url) -> LaunchParams {
        let get = |key: &str| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
                .filter(|v| !v.is_empty())
        };
        LaunchParams {
            token: get("moodle_token").or_else(|| get("token")),
            origin: get("origin").unwrap_or_else(|| "moodle".to_string()),
            course_id: get("course_id"),
            page: get("page").unwrap_or_else(|| "chat".to_string()),
        }
    }

    /// True when the page was launched from the host with a token.
    pub fn from_host(&self) -> bool {
        self.token.is_some() && self.origin == "moodle"
    }
}

/// The launch URL with the token parameters removed, for history replacement,
/// so the credential is neither re-sent nor bookmarked.
pub fn strip_token(url: &Url) -> Url {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "moodle_token" && k != "token")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut stripped = url.clone();
    stripped.set_query(None);
    if !retained.is_empty() {
        let mut pairs = stripped.query_pairs_mut();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
    }
    stripped
}

/// Decode the claims segment of a compact two/three-part token.
///
/// Only the first base64url segment is decoded as JSON; the signature is NOT
/// checked. This is a display-only fallback for when the validation endpoint
/// is unreachable, not a trust decision.
pub fn decode_token_claims(token: &str) -> Option<UserIdentity> {
    let parts: Vec<&str> = token.split('.').collect();
    if !(2..=3).contains(&parts.len()) {
        return None;
    }
    let raw = URL_SAFE_NO_PAD.decode(parts[0].trim_end_matches('=')).ok()?;
    let value: Value = serde_json::from_slice(&raw).ok()?;
    let mut identity = UserIdentity::normalize(&value)?;
    identity.from_host = true;
    Some(identity)
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeOutcome {
    /// Initial, transient state. Also the resting state of a framed page that
    /// is waiting for a host push.
    Loading,
    /// One user governs the session. `verified` is false when the identity
    /// came from the local token decode rather than backend validation.
    /// `sanitized_url` is the launch URL with the token removed, present
    /// when the identity was carried by a URL token; the embedding shell
    /// applies it so the credential is neither re-sent nor bookmarked.
    Authenticated {
        identity: UserIdentity,
        verified: bool,
        sanitized_url: Option<Url>,
    },
    /// Synthetic identity for a top-level page with no host and no token.
    Guest(UserIdentity),
    /// Token-required context failed validation and no fallback applied.
    Denied(String),
}

impl HandshakeOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HandshakeOutcome::Loading)
    }

    pub fn identity(&self) -> Option<&UserIdentity> {
        match self {
            HandshakeOutcome::Authenticated { identity, .. } => Some(identity),
            HandshakeOutcome::Guest(identity) => Some(identity),
            _ => None,
        }
    }
}

/// Where the page is running: inside a host frame or top-level, and whether
/// development affordances apply.
#[derive(Debug, Clone, Default)]
pub struct EmbedContext {
    pub embedded: bool,
    pub dev_mode: bool,
    pub launch: LaunchParams,
    /// The full launch URL, kept so a token-borne sign-in can hand back its
    /// stripped form for history replacement.
    pub page_url: Option<Url>,
}

// ---------------------------------------------------------------------------
// Host frame messaging
// ---------------------------------------------------------------------------

/// Channel pair standing in for cross-frame messaging: identity pushes come
/// in, identity requests go out.
pub struct HostFrame {
    pub inbound: mpsc::UnboundedReceiver<Value>,
    pub outbound: mpsc::UnboundedSender<Value>,
}

impl HostFrame {
    /// Build a frame plus the host-side handles (push sender, request
    /// receiver).
    pub fn channel() -> (
        HostFrame,
        mpsc::UnboundedSender<Value>,
        mpsc::UnboundedReceiver<Value>,
    ) {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let frame = HostFrame {
            inbound: push_rx,
            outbound: request_tx,
        };
        (frame, push_tx, request_rx)
    }
}

/// The outbound message asking the parent frame for the current user.
pub fn host_request_message(namespace: &str) -> Value {
    serde_json::json!({ "type": format!("{}_request_moodle_user", namespace) })
}

/// Extract an identity from an inbound host message: either the typed
/// envelope `{type: "<ns>_moodle_user", payload}` or a bare object carrying
/// identity fields directly. Host-pushed identity is always host-sourced.
pub fn host_push_identity(namespace: &str, payload: &Value) -> Option<UserIdentity> {
    let envelope_type = format!("{}_moodle_user", namespace);
    let mut identity = if payload.get("type").and_then(Value::as_str) == Some(&envelope_type) {
        UserIdentity::normalize(payload.get("payload")?)?
    } else {
        UserIdentity::normalize(payload)?
    };
    identity.from_host = true;
    Some(identity)
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct HandshakeResolver {
    api: ChatApi,
    store: IdentityStore,
    ctx: EmbedContext,
    namespace: String,
    outcome: HandshakeOutcome,
}

impl HandshakeResolver {
    pub fn new(api: ChatApi, store: IdentityStore, ctx: EmbedContext) -> HandshakeResolver {
        let namespace = api.config().namespace.clone();
        HandshakeResolver {
            api,
            store,
            ctx,
            namespace,
            outcome: HandshakeOutcome::Loading,
        }
    }

    pub fn outcome(&self) -> &HandshakeOutcome {
        &self.outcome
    }

    /// Run steps 1-4 of the handshake and settle the outcome. A standing
    /// host-push listener (step 5) stays valid afterwards via
    /// [`apply_host_push`](Self::apply_host_push).
    pub async fn resolve(&mut self) -> HandshakeOutcome {
        let next = match self.try_resolve().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "handshake failed unexpectedly");
                if self.ctx.dev_mode {
                    let identity = UserIdentity::dev();
                    self.store.write(&identity);
                    HandshakeOutcome::Authenticated {
                        identity,
                        verified: true,
                        sanitized_url: None,
                    }
                } else {
                    HandshakeOutcome::Denied("session validation failed".to_string())
                }
            }
        };
        self.transition(next)
    }

    async fn try_resolve(&mut self) -> Result<HandshakeOutcome, ChatError> {
        // 1. a stored record short-circuits the handshake
        if let Some(existing) = self.store.read() {
            if !existing.is_guest() {
                return Ok(HandshakeOutcome::Authenticated {
                    identity: existing,
                    verified: true,
                    sanitized_url: None,
                });
            }
            if !self.ctx.embedded && !self.ctx.dev_mode {
                return Ok(HandshakeOutcome::Guest(existing));
            }
            // guest record inside a frame or under dev mode: fall through,
            // steps 2 and 5 can still upgrade it
        }

        // 2. development mode always admits
        if self.ctx.dev_mode {
            let identity = UserIdentity::dev();
            self.store.write(&identity);
            return Ok(HandshakeOutcome::Authenticated {
                identity,
                verified: true,
                sanitized_url: None,
            });
        }

        let token = self
            .ctx
            .launch
            .token
            .clone()
            .filter(|_| self.ctx.launch.from_host());

        // 3. no embedding token
        let Some(token) = token else {
            if self.ctx.embedded {
                // do not force guest inside a frame, that would race the host
                return Ok(HandshakeOutcome::Loading);
            }
            let identity = UserIdentity::guest();
            self.store.write(&identity);
            return Ok(HandshakeOutcome::Guest(identity));
        };

        // 4. validate the token, bounded by the handshake timeout
        info!("embedding token detected, validating");
        let bound = self.api.config().handshake_timeout;
        let validated = tokio::time::timeout(
            bound,
            self.api
                .validate_session(&token, &self.ctx.launch.origin, &self.ctx.launch.page),
        )
        .await;

        let reason = match validated {
            Ok(Ok(identity)) => {
                self.store.write(&identity);
                return Ok(HandshakeOutcome::Authenticated {
                    identity,
                    verified: true,
                    sanitized_url: self.sanitized_page_url(),
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => ChatError::Timeout(bound.as_secs()).to_string(),
        };

        warn!(%reason, "validation failed, trying local token decode");
        if let Some(identity) = decode_token_claims(&token) {
            self.store.write(&identity);
            return Ok(HandshakeOutcome::Authenticated {
                identity,
                verified: false,
                sanitized_url: self.sanitized_page_url(),
            });
        }
        Ok(HandshakeOutcome::Denied(reason))
    }

    /// Step 5: fold an inbound host message into the outcome. Host identity
    /// always wins, overriding a terminal `Guest` or `Denied` state.
    pub fn apply_host_push(&mut self, payload: &Value) -> Option<HandshakeOutcome> {
        let identity = host_push_identity(&self.namespace, payload)?;
        info!(user = ?identity.user_id, "host push received");
        self.store.write(&identity);
        self.outcome = HandshakeOutcome::Authenticated {
            identity,
            verified: true,
            sanitized_url: None,
        };
        Some(self.outcome.clone())
    }

    fn sanitized_page_url(&self) -> Option<Url> {
        self.ctx.page_url.as_ref().map(strip_token)
    }

    /// Monotonic transition rule for non-push decisions: `Loading` may move
    /// anywhere; `Guest`/`Denied` may only be upgraded to `Authenticated`;
    /// `Authenticated` never downgrades.
    fn transition(&mut self, next: HandshakeOutcome) -> HandshakeOutcome {
        let allowed = match (&self.outcome, &next) {
            (HandshakeOutcome::Loading, _) => true,
            (
                HandshakeOutcome::Guest(_) | HandshakeOutcome::Denied(_),
                HandshakeOutcome::Authenticated { .. },
            ) => true,
            _ => false,
        };
        if allowed {
            self.outcome = next;
        }
        self.outcome.clone()
    }

    /// Drive the whole handshake on a task: request identity from the parent
    /// when embedded, resolve, then keep folding host pushes. Observers watch
    /// the outcome.
    pub fn spawn(mut self, mut host: HostFrame) -> watch::Receiver<HandshakeOutcome> {
        let (tx, rx) = watch::channel(HandshakeOutcome::Loading);
        tokio::spawn(async move {
            if self.ctx.embedded {
                let _ = host.outbound.send(host_request_message(&self.namespace));
            }
            let first = self.resolve().await;
            let _ = tx.send(first);
            while let Some(payload) = host.inbound.recv().await {
                if let Some(next) = self.apply_host_push(&payload) {
                    let _ = tx.send(next);
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatConfig;
    use rstest::rstest;
    use serde_json::json;

    fn make_resolver(ctx: EmbedContext) -> HandshakeResolver {
        let store = IdentityStore::ephemeral();
        let api = ChatApi::new(ChatConfig::default(), store.clone());
        HandshakeResolver::new(api, store, ctx)
    }

    fn claims_token(claims: &Value) -> String {
        let segment = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.signature", segment)
    }

    // -- launch params --

    #[rstest]
    #[case("https://chat.example/?moodle_token=abc&origin=moodle", Some("abc"))]
    #[case("https://chat.example/?token=xyz", Some("xyz"))]
    #[case("https://chat.example/?course_id=c1", None)]
    #[case("https://chat.example/", None)]
    fn test_launch_params_token(#[case] url: &str, #[case] expected: Option<&str>) {
        let params = LaunchParams::from_url(&Url::parse(url).expect("url"));
        assert_eq!(params.token.as_deref(), expected);
    }

    #[test]
    fn test_launch_params_moodle_token_wins_over_token() {
        let url = Url::parse("https://chat.example/?moodle_token=a&token=b").expect("url");
        let params = LaunchParams::from_url(&url);
        assert_eq!(params.token.as_deref(), Some("a"));
    }

    #[test]
    fn test_launch_params_defaults() {
        let params = LaunchParams::from_url(&Url::parse("https://chat.example/").expect("url"));
        assert_eq!(params.origin, "moodle");
        assert_eq!(params.page, "chat");
        assert!(params.course_id.is_none());
        assert!(!params.from_host());
    }

    #[test]
    fn test_launch_params_from_host_requires_moodle_origin() {
        let url = Url::parse("https://chat.example/?token=t&origin=other").expect("url");
        assert!(!LaunchParams::from_url(&url).from_host());
        let url = Url::parse("https://chat.example/?token=t&origin=moodle").expect("url");
        assert!(LaunchParams::from_url(&url).from_host());
    }

    #[test]
    fn test_strip_token_removes_both_spellings() {
        let url = Url::parse(
            "https://chat.example/?moodle_token=a&token=b&course_id=c1&page=chat",
        )
        .expect("url");
        let stripped = strip_token(&url);
        let query = stripped.query().unwrap_or_default();
        assert!(!query.contains("token"));
        assert!(query.contains("course_id=c1"));
        assert!(query.contains("page=chat"));
    }

    #[test]
    fn test_strip_token_drops_query_when_nothing_retained() {
        let url = Url::parse("https://chat.example/?moodle_token=a").expect("url");
        assert!(strip_token(&url).query().is_none());
    }

    // -- token decode --

    #[test]
    fn test_decode_token_claims() {
        let token = claims_token(&json!({"user_id": "u1", "user_name": "Ana"}));
        let identity = decode_token_claims(&token).expect("identity");
        assert_eq!(identity.user_id.as_deref(), Some("u1"));
        assert_eq!(identity.user_name.as_deref(), Some("Ana"));
        assert!(identity.from_host);
    }

    #[test]
    fn test_decode_token_claims_three_part() {
        let segment = URL_SAFE_NO_PAD.encode(json!({"id": "u2"}).to_string());
        let token = format!("{}.header.signature", segment);
        assert!(decode_token_claims(&token).is_some());
    }

    #[test]
    fn test_decode_token_rejects_single_segment() {
        let segment = URL_SAFE_NO_PAD.encode(json!({"id": "u2"}).to_string());
        assert!(decode_token_claims(&segment).is_none());
    }

    #[test]
    fn test_decode_token_rejects_garbage() {
        assert!(decode_token_claims("not.a.token").is_none());
        assert!(decode_token_claims("..").is_none());
    }

    #[test]
    fn test_decode_token_rejects_unidentified_claims() {
        let token = claims_token(&json!({"exp": 123}));
        assert!(decode_token_claims(&token).is_none());
    }

    // -- host messages --

    #[test]
    fn test_host_request_message_shape() {
        let message = host_request_message("lms");
        assert_eq!(
            message.get("type").and_then(Value::as_str),
            Some("lms_request_moodle_user")
        );
    }

    #[test]
    fn test_host_push_identity_typed_envelope() {
        let payload = json!({
            "type": "lms_moodle_user",
            "payload": {"userId": "u1", "userName": "Ana"}
        });
        let identity = host_push_identity("lms", &payload).expect("identity");
        assert_eq!(identity.user_id.as_deref(), Some("u1"));
        assert!(identity.from_host);
    }

    #[test]
    fn test_host_push_identity_bare_object() {
        let identity =
            host_push_identity("lms", &json!({"user_email": "a@b.c"})).expect("identity");
        assert_eq!(identity.user_email.as_deref(), Some("a@b.c"));
        assert!(identity.from_host);
    }

    #[test]
    fn test_host_push_identity_rejects_empty() {
        assert!(host_push_identity("lms", &json!({})).is_none());
        assert!(host_push_identity("lms", &json!({"type": "lms_moodle_user"})).is_none());
    }

    // -- resolver (paths that need no backend) --

    #[tokio::test]
    async fn test_resolve_dev_mode_synthesizes_identity() {
        let mut resolver = make_resolver(EmbedContext {
            dev_mode: true,
            ..EmbedContext::default()
        });
        match resolver.resolve().await {
            HandshakeOutcome::Authenticated { identity, verified, .. } => {
                assert!(verified);
                assert_eq!(identity.user_id.as_deref(), Some("dev-user"));
            }
            other => panic!("expected authenticated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_top_level_without_token_is_guest() {
        let mut resolver = make_resolver(EmbedContext::default());
        match resolver.resolve().await {
            HandshakeOutcome::Guest(identity) => {
                assert_eq!(identity.user_id.as_deref(), Some("guest"));
            }
            other => panic!("expected guest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_framed_without_token_stays_loading() {
        let mut resolver = make_resolver(EmbedContext {
            embedded: true,
            ..EmbedContext::default()
        });
        assert_eq!(resolver.resolve().await, HandshakeOutcome::Loading);
    }

    #[tokio::test]
    async fn test_resolve_stored_host_identity_short_circuits() {
        let store = IdentityStore::ephemeral();
        store.write(&UserIdentity {
            user_id: Some("u1".to_string()),
            user_name: None,
            user_email: None,
            from_host: true,
        });
        let api = ChatApi::new(ChatConfig::default(), store.clone());
        let mut resolver = HandshakeResolver::new(api, store, EmbedContext::default());
        match resolver.resolve().await {
            HandshakeOutcome::Authenticated { identity, verified, .. } => {
                assert!(verified);
                assert_eq!(identity.user_id.as_deref(), Some("u1"));
            }
            other => panic!("expected authenticated, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_stored_guest_in_frame_falls_through_to_loading() {
        let store = IdentityStore::ephemeral();
        store.write(&UserIdentity::guest());
        let api = ChatApi::new(ChatConfig::default(), store.clone());
        let mut resolver = HandshakeResolver::new(
            api,
            store,
            EmbedContext { embedded: true, ..EmbedContext::default() },
        );
        assert_eq!(resolver.resolve().await, HandshakeOutcome::Loading);
    }

    #[tokio::test]
    async fn test_host_push_overrides_guest() {
        let mut resolver = make_resolver(EmbedContext::default());
        assert!(matches!(resolver.resolve().await, HandshakeOutcome::Guest(_)));

        let outcome = resolver
            .apply_host_push(&json!({"userId": "u7", "userName": "Pushed"}))
            .expect("override");
        match outcome {
            HandshakeOutcome::Authenticated { identity, .. } => {
                assert_eq!(identity.user_id.as_deref(), Some("u7"));
            }
            other => panic!("expected authenticated, got {:?}", other),
        }
        // and the store reflects it for subsequent reads
        let stored = resolver.store.read().expect("stored");
        assert_eq!(stored.user_id.as_deref(), Some("u7"));
    }

    #[tokio::test]
    async fn test_host_push_ignores_junk() {
        let mut resolver = make_resolver(EmbedContext::default());
        resolver.resolve().await;
        assert!(resolver.apply_host_push(&json!({"noise": true})).is_none());
        assert!(matches!(resolver.outcome(), HandshakeOutcome::Guest(_)));
    }

    #[test]
    fn test_transition_authenticated_never_downgrades() {
        let mut resolver = make_resolver(EmbedContext::default());
        resolver.outcome = HandshakeOutcome::Authenticated {
            identity: UserIdentity::dev(),
            verified: true,
            sanitized_url: None,
        };
        let result = resolver.transition(HandshakeOutcome::Denied("late".to_string()));
        assert!(matches!(result, HandshakeOutcome::Authenticated { .. }));
    }

    #[test]
    fn test_transition_denied_upgrades_only_to_authenticated() {
        let mut resolver = make_resolver(EmbedContext::default());
        resolver.outcome = HandshakeOutcome::Denied("bad token".to_string());
        let still = resolver.transition(HandshakeOutcome::Guest(UserIdentity::guest()));
        assert!(matches!(still, HandshakeOutcome::Denied(_)));
        let upgraded = resolver.transition(HandshakeOutcome::Authenticated {
            identity: UserIdentity::dev(),
            verified: true,
            sanitized_url: None,
        });
        assert!(matches!(upgraded, HandshakeOutcome::Authenticated { .. }));
    }

    #[tokio::test]
    async fn test_token_outcome_carries_stripped_launch_url() {
        let token = claims_token(&json!({"user_id": "u1"}));
        let page = Url::parse(&format!(
            "https://chat.example/?moodle_token={}&course_id=c42",
            token
        ))
        .expect("url");

        // unroutable backend, so the local decode fallback settles the outcome
        let store = IdentityStore::ephemeral();
        let config = ChatConfig {
            api_base_url: "http://127.0.0.1:1/api".to_string(),
            ..ChatConfig::default()
        };
        let api = ChatApi::new(config, store.clone());
        let ctx = EmbedContext {
            embedded: true,
            dev_mode: false,
            launch: LaunchParams::from_url(&page),
            page_url: Some(page),
        };
        let mut resolver = HandshakeResolver::new(api, store, ctx);

        match resolver.resolve().await {
            HandshakeOutcome::Authenticated { verified, sanitized_url, .. } => {
                assert!(!verified);
                let sanitized = sanitized_url.expect("stripped url");
                let query = sanitized.query().unwrap_or_default();
                assert!(!query.contains("moodle_token"));
                assert!(query.contains("course_id=c42"));
            }
            other => panic!("expected authenticated, got {:?}", other),
        }
    }

    #[test]
    fn test_outcome_identity_accessor() {
        let outcome = HandshakeOutcome::Guest(UserIdentity::guest());
        assert!(outcome.identity().is_some());
        assert!(HandshakeOutcome::Loading.identity().is_none());
        assert!(HandshakeOutcome::Denied("x".to_string()).identity().is_none());
    }
}
