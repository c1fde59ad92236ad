//! End-to-end session lifecycle against a scripted backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use serde_json::json;
use tokio::sync::Notify;

use beehus_session_core::auth::{MemoryTokenStore, TokenSlot, TokenStore};
use beehus_session_core::{
    ApiClient, ApiError, AuthApi, Role, RouteAccess, SessionError, SessionManager, TokenPair,
    UserProfile,
};

// ============================================================================
// Scripted backend
// ============================================================================

#[derive(Default)]
struct ScriptedApi {
    /// access token -> profile
    users: Mutex<HashMap<String, UserProfile>>,
    /// refresh token -> pair issued in exchange
    renewals: Mutex<HashMap<String, TokenPair>>,
    /// (email, password) -> pair
    accounts: Mutex<HashMap<(String, String), TokenPair>>,
    /// When set, refresh waits here before answering
    refresh_gate: Option<Arc<Notify>>,
    /// When set, the next profile request waits here before answering
    profile_gate: Mutex<Option<Arc<Notify>>>,
    refresh_calls: AtomicUsize,
    profile_calls: AtomicUsize,
}

impl ScriptedApi {
    fn knows_user(&self, access_token: &str, user: UserProfile) {
        self.users.lock().unwrap().insert(access_token.to_string(), user);
    }

    fn renews(&self, refresh_token: &str, pair: TokenPair) {
        self.renewals.lock().unwrap().insert(refresh_token.to_string(), pair);
    }

    fn hold_next_profile(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.profile_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    fn forget_user(&self, access_token: &str) {
        self.users.lock().unwrap().remove(access_token);
    }

    fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthApi for ScriptedApi {
    async fn authenticate(&self, email: &str, password: &str) -> Result<TokenPair, ApiError> {
        self.accounts
            .lock()
            .unwrap()
            .get(&(email.to_string(), password.to_string()))
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("Could not validate credentials"))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.refresh_gate {
            gate.notified().await;
        }
        self.renewals
            .lock()
            .unwrap()
            .get(refresh_token)
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("Could not validate credentials"))
    }

    async fn current_user(&self, access_token: &str) -> Result<UserProfile, ApiError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.profile_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.users
            .lock()
            .unwrap()
            .get(access_token)
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("Could not validate credentials"))
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// JWT-shaped token expiring `secs` from now; `tag` keeps tokens distinct
fn jwt_expiring_in(secs: i64, tag: &str) -> String {
    let header = general_purpose::URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = json!({
        "sub": "ana@beehus.io",
        "type": "access",
        "jti": tag,
        "exp": Utc::now().timestamp() + secs,
    });
    let body = general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{}.{}.sig", header, body)
}

fn profile(role: Role) -> UserProfile {
    UserProfile {
        id: "64f0c2a1".to_string(),
        email: "ana@beehus.io".to_string(),
        full_name: Some("Ana Souza".to_string()),
        role,
        is_active: true,
        created_at: Utc::now(),
        last_login: None,
    }
}

fn session_with(api: &Arc<ScriptedApi>, store: &Arc<MemoryTokenStore>) -> SessionManager {
    SessionManager::new(
        Arc::clone(api) as Arc<dyn AuthApi>,
        Arc::clone(store) as Arc<dyn TokenStore>,
    )
}

fn assert_logged_out(session: &SessionManager, store: &MemoryTokenStore) {
    assert!(!session.is_authenticated());
    assert!(!session.is_admin());
    assert_eq!(session.access_token(), None);
    assert_eq!(session.refresh_token(), None);
    assert_eq!(session.user(), None);
    assert_eq!(session.authorization_header(), None);
    assert!(!session.renewal_armed());
    assert_eq!(store.load(TokenSlot::Access).unwrap(), None);
    assert_eq!(store.load(TokenSlot::Refresh).unwrap(), None);
}

// ============================================================================
// Login
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_login_loads_profile_and_arms_renewal() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    let access = jwt_expiring_in(300, "a1");
    api.knows_user(&access, profile(Role::Admin));
    let session = session_with(&api, &store);

    let user = session.login(access.clone(), "r1").await.unwrap();

    assert_eq!(user.email, "ana@beehus.io");
    assert!(session.is_authenticated());
    assert!(session.is_admin());
    assert_eq!(session.access_token().as_deref(), Some(access.as_str()));
    assert_eq!(session.refresh_token().as_deref(), Some("r1"));
    assert_eq!(session.authorization_header(), Some(format!("Bearer {}", access)));
    assert_eq!(store.load(TokenSlot::Access).unwrap().as_deref(), Some(access.as_str()));
    assert_eq!(store.load(TokenSlot::Refresh).unwrap().as_deref(), Some("r1"));

    // 300s to expiry minus the 60s lead; allow for wall-clock drift in the test
    let due = session.renewal_due_in().unwrap();
    assert!(due <= Duration::from_secs(240), "due in {:?}", due);
    assert!(due >= Duration::from_secs(238), "due in {:?}", due);
}

#[tokio::test(start_paused = true)]
async fn test_login_with_rejected_profile_tears_down() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    let session = session_with(&api, &store);

    let err = session.login(jwt_expiring_in(300, "a1"), "r1").await.unwrap_err();

    assert!(matches!(err, SessionError::ProfileLoad(ApiError::Rejected { status: 401, .. })));
    assert_logged_out(&session, &store);
}

#[tokio::test(start_paused = true)]
async fn test_expired_token_still_renews_after_floor() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    let expired = jwt_expiring_in(-3600, "old");
    api.knows_user(&expired, profile(Role::User));
    let session = session_with(&api, &store);

    session.login(expired, "r1").await.unwrap();
    assert_eq!(session.renewal_due_in(), Some(Duration::from_secs(1)));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(api.refresh_calls(), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(api.refresh_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_token_without_expiry_is_never_renewed() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    api.knows_user("opaque-session-token", profile(Role::User));
    let session = session_with(&api, &store);

    session.login("opaque-session-token", "r1").await.unwrap();
    assert!(session.is_authenticated());
    assert!(!session.renewal_armed());

    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
    assert_eq!(api.refresh_calls(), 0);
    assert!(session.is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_sign_in_with_password() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    let access = jwt_expiring_in(3600, "a1");
    api.accounts.lock().unwrap().insert(
        ("ana@beehus.io".to_string(), "s3cret".to_string()),
        TokenPair::new(access.clone(), "r1"),
    );
    api.knows_user(&access, profile(Role::User));
    let session = session_with(&api, &store);

    let err = session.sign_in("ana@beehus.io", "wrong").await.unwrap_err();
    assert!(matches!(err, SessionError::SignIn(ApiError::Rejected { status: 401, .. })));
    assert_logged_out(&session, &store);

    let user = session.sign_in("ana@beehus.io", "s3cret").await.unwrap();
    assert_eq!(user.role, Role::User);
    assert!(session.is_authenticated());
    assert!(!session.is_admin());
}

// ============================================================================
// Renewal
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_renewal_fires_once_and_rotates() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    let first = jwt_expiring_in(300, "a1");
    let second = jwt_expiring_in(300, "a2");
    api.knows_user(&first, profile(Role::Admin));
    api.renews("r1", TokenPair::new(second.clone(), "r2"));
    let session = session_with(&api, &store);

    session.login(first, "r1").await.unwrap();
    assert_eq!(api.profile_calls(), 1);

    tokio::time::sleep(Duration::from_secs(237)).await;
    assert_eq!(api.refresh_calls(), 0);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(api.refresh_calls(), 1);

    // Rotated without re-fetching the profile
    assert_eq!(session.access_token().as_deref(), Some(second.as_str()));
    assert_eq!(session.refresh_token().as_deref(), Some("r2"));
    let user = session.user().expect("profile kept across renewal");
    assert!(user.is_admin());
    assert_eq!(api.profile_calls(), 1);
    assert_eq!(session.authorization_header(), Some(format!("Bearer {}", second)));
    assert_eq!(store.load(TokenSlot::Refresh).unwrap().as_deref(), Some("r2"));

    // The new token got its own timer
    assert!(session.renewal_armed());
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(api.refresh_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_renewal_failure_logs_out() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    let access = jwt_expiring_in(120, "a1");
    api.knows_user(&access, profile(Role::Admin));
    let session = session_with(&api, &store);

    let base = ApiClient::new("http://localhost:8000", Duration::from_secs(5)).unwrap();
    let client = session.client(&base);

    session.login(access, "r-revoked").await.unwrap();
    assert!(client.bearer_token().is_some());

    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(api.refresh_calls(), 1);
    assert_logged_out(&session, &store);
    assert!(client.bearer_token().is_none());
    assert_eq!(
        RouteAccess::check(&session.snapshot(), false),
        RouteAccess::RedirectToLogin
    );
}

#[tokio::test(start_paused = true)]
async fn test_manual_refresh_when_logged_out_is_noop() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    let session = session_with(&api, &store);

    session.refresh().await.unwrap();
    assert_eq!(api.refresh_calls(), 0);
    assert_eq!(session.fetch_current_user().await.unwrap(), None);
    assert_eq!(api.profile_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rotate_tokens_keeps_profile_and_rearms() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    let access = jwt_expiring_in(3600, "a1");
    api.knows_user(&access, profile(Role::Admin));
    let session = session_with(&api, &store);

    session.login(access, "r1").await.unwrap();
    let before = session.renewal_due_in().unwrap();

    session.rotate_tokens(jwt_expiring_in(600, "a2"), "r2");

    assert!(session.is_admin());
    assert_eq!(api.profile_calls(), 1);
    let after = session.renewal_due_in().unwrap();
    assert!(after < before);
    assert!(after <= Duration::from_secs(540));
    assert_eq!(store.load(TokenSlot::Refresh).unwrap().as_deref(), Some("r2"));
}

// ============================================================================
// Logout and cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_logout_cancels_pending_renewal() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    let access = jwt_expiring_in(90, "a1");
    api.knows_user(&access, profile(Role::User));
    api.renews("r1", TokenPair::new(jwt_expiring_in(900, "a2"), "r2"));
    let session = session_with(&api, &store);

    session.login(access, "r1").await.unwrap();
    assert!(session.renewal_armed());

    session.logout();
    assert_logged_out(&session, &store);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(api.refresh_calls(), 0);
    assert!(!session.is_authenticated());
}

#[tokio::test(start_paused = true)]
async fn test_logout_during_inflight_refresh_discards_result() {
    let gate = Arc::new(Notify::new());
    let api = Arc::new(ScriptedApi {
        refresh_gate: Some(Arc::clone(&gate)),
        ..ScriptedApi::default()
    });
    let store = Arc::new(MemoryTokenStore::default());
    let access = jwt_expiring_in(3600, "a1");
    api.knows_user(&access, profile(Role::User));
    api.renews("r1", TokenPair::new(jwt_expiring_in(3600, "a2"), "r2"));
    let session = session_with(&api, &store);
    session.login(access, "r1").await.unwrap();

    let background = session.clone();
    let refresh = tokio::spawn(async move { background.refresh().await });
    while api.refresh_calls() == 0 {
        tokio::task::yield_now().await;
    }

    session.logout();
    gate.notify_one();

    let result = refresh.await.unwrap();
    assert!(matches!(result, Err(SessionError::Superseded)));
    assert_logged_out(&session, &store);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_current_user_rejected_ends_session() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    let access = jwt_expiring_in(3600, "a1");
    api.knows_user(&access, profile(Role::Admin));
    let session = session_with(&api, &store);
    session.login(access.clone(), "r1").await.unwrap();

    // Still valid: refreshes the cached profile
    assert!(session.fetch_current_user().await.unwrap().is_some());
    assert_eq!(api.profile_calls(), 2);

    // Account deactivated server-side
    api.forget_user(&access);
    let err = session.fetch_current_user().await.unwrap_err();

    assert!(matches!(err, SessionError::ProfileLoad(ApiError::Rejected { status: 401, .. })));
    assert_logged_out(&session, &store);
    assert_eq!(
        RouteAccess::check(&session.snapshot(), false),
        RouteAccess::RedirectToLogin
    );
}

/// Start a profile request that holds the in-flight guard until released
async fn occupy_in_flight(
    api: &Arc<ScriptedApi>,
    session: &SessionManager,
) -> (Arc<Notify>, tokio::task::JoinHandle<Result<Option<UserProfile>, SessionError>>) {
    let gate = api.hold_next_profile();
    let calls = api.profile_calls();
    let background = session.clone();
    let task = tokio::spawn(async move { background.fetch_current_user().await });
    while api.profile_calls() == calls {
        tokio::task::yield_now().await;
    }
    (gate, task)
}

#[tokio::test(start_paused = true)]
async fn test_timer_renewal_waiting_behind_login_is_dropped() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    let first = jwt_expiring_in(120, "a1");
    let second = jwt_expiring_in(3600, "a2");
    api.knows_user(&first, profile(Role::User));
    api.knows_user(&second, profile(Role::Admin));
    api.renews("r1", TokenPair::new(jwt_expiring_in(3600, "a3"), "r3"));
    let session = session_with(&api, &store);
    session.login(first.clone(), "r1").await.unwrap();

    let (gate, fetch) = occupy_in_flight(&api, &session).await;

    // Queue a second login behind the held guard
    let background = session.clone();
    let second_login = second.clone();
    let login = tokio::spawn(async move { background.login(second_login, "r2").await });
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    // The renewal timer fires and queues behind both
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(!session.renewal_armed());

    gate.notify_one();
    assert!(fetch.await.unwrap().unwrap().is_some());
    assert!(login.await.unwrap().is_ok());
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(api.refresh_calls(), 0);
    assert_eq!(session.access_token().as_deref(), Some(second.as_str()));
    assert_eq!(session.refresh_token().as_deref(), Some("r2"));
    assert!(session.is_admin());
    assert!(session.renewal_armed());
}

#[tokio::test(start_paused = true)]
async fn test_timer_renewal_dropped_after_rotation() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    let first = jwt_expiring_in(120, "a1");
    let rotated = jwt_expiring_in(3600, "a2");
    api.knows_user(&first, profile(Role::User));
    api.renews("r1", TokenPair::new(jwt_expiring_in(3600, "a3"), "r3"));
    let session = session_with(&api, &store);
    session.login(first, "r1").await.unwrap();

    let (gate, fetch) = occupy_in_flight(&api, &session).await;

    // Timer fires and waits for the guard
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(!session.renewal_armed());

    session.rotate_tokens(rotated.clone(), "r2");
    assert!(session.renewal_armed());

    gate.notify_one();
    // The profile answer belongs to the pre-rotation session
    assert!(matches!(fetch.await.unwrap(), Err(SessionError::Superseded)));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(api.refresh_calls(), 0);
    assert_eq!(session.access_token().as_deref(), Some(rotated.as_str()));
    assert_eq!(session.refresh_token().as_deref(), Some("r2"));
    assert!(session.is_authenticated());
}

// ============================================================================
// Storage
// ============================================================================

/// Records whether the session reads as signed in at each write
#[derive(Default)]
struct ObservingStore {
    slots: MemoryTokenStore,
    session: Mutex<Option<SessionManager>>,
    seen: Mutex<Vec<bool>>,
}

impl ObservingStore {
    fn observe(&self) {
        if let Some(session) = self.session.lock().unwrap().as_ref() {
            self.seen.lock().unwrap().push(session.is_authenticated());
        }
    }
}

impl TokenStore for ObservingStore {
    fn load(&self, slot: TokenSlot) -> anyhow::Result<Option<String>> {
        self.slots.load(slot)
    }

    fn save(&self, slot: TokenSlot, value: &str) -> anyhow::Result<()> {
        self.observe();
        self.slots.save(slot, value)
    }

    fn remove(&self, slot: TokenSlot) -> anyhow::Result<()> {
        self.observe();
        self.slots.remove(slot)
    }
}

#[tokio::test(start_paused = true)]
async fn test_storage_written_after_state_is_released() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(ObservingStore::default());
    let access = jwt_expiring_in(3600, "a1");
    api.knows_user(&access, profile(Role::User));
    let session = SessionManager::new(
        Arc::clone(&api) as Arc<dyn AuthApi>,
        Arc::clone(&store) as Arc<dyn TokenStore>,
    );
    *store.session.lock().unwrap() = Some(session.clone());

    session.login(access.clone(), "r1").await.unwrap();
    session.logout();

    // Each write sees the committed state instead of blocking on it
    assert_eq!(*store.seen.lock().unwrap(), vec![true, true, false, false]);
    assert_eq!(store.slots.load(TokenSlot::Access).unwrap(), None);

    store.session.lock().unwrap().take();
}

// ============================================================================
// Restore
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_restore_rehydrates_and_verifies() {
    let api = Arc::new(ScriptedApi::default());
    let access = jwt_expiring_in(1800, "a1");
    api.knows_user(&access, profile(Role::Admin));
    let store = Arc::new(MemoryTokenStore::with_tokens(Some(&access), Some("r1")));
    let session = session_with(&api, &store);

    assert!(session.restore().await.unwrap());
    assert!(session.is_authenticated());
    assert!(session.is_admin());
    assert!(session.renewal_armed());
    assert_eq!(
        RouteAccess::check(&session.snapshot(), true),
        RouteAccess::Granted
    );
}

#[tokio::test(start_paused = true)]
async fn test_restore_half_pair_is_discarded() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::with_tokens(Some("a-orphan"), None));
    let session = session_with(&api, &store);

    assert!(!session.restore().await.unwrap());
    assert_logged_out(&session, &store);
    assert_eq!(api.profile_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_restore_with_rejected_token_ends_session() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::with_tokens(Some("a-stale"), Some("r-stale")));
    let session = session_with(&api, &store);

    let err = session.restore().await.unwrap_err();
    assert!(matches!(err, SessionError::ProfileLoad(_)));
    assert_logged_out(&session, &store);
}

#[tokio::test(start_paused = true)]
async fn test_restore_empty_store() {
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(MemoryTokenStore::default());
    let session = session_with(&api, &store);

    assert!(!session.restore().await.unwrap());
    assert!(!session.is_authenticated());
}
