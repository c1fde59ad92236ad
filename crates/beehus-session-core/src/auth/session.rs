//! The authoritative session state and every transition on it.
//!
//! `SessionManager` is the single owner of the token pair and the cached
//! profile. Each transition happens under one lock and, before the lock is
//! released, updates the authorization injector and re-arms (or cancels)
//! the renewal timer. The tokens are then mirrored into storage in
//! transition order, outside the state lock.
//!
//! Network-bound operations are serialized by an in-flight guard. Every
//! token transition bumps an epoch; a response that comes back after the
//! epoch moved on (logout, a newer login) is dropped as `Superseded`.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::api::client::BearerFeed;
use crate::api::{ApiClient, AuthApi};
use crate::models::{TokenPair, UserProfile};
use crate::token::decode_expiry;

use super::error::SessionError;
use super::injector::AuthorizationInjector;
use super::scheduler::{renewal_delay, RenewalScheduler};
use super::storage::{TokenSlot, TokenStore};

/// Point-in-time copy of the session, with the derived flags
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub tokens: Option<TokenPair>,
    pub user: Option<UserProfile>,
}

impl SessionSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.user.as_ref().map(|u| u.is_admin()).unwrap_or(false)
    }
}

#[derive(Default)]
struct SessionState {
    tokens: Option<TokenPair>,
    user: Option<UserProfile>,
    epoch: u64,
}

/// What a token transition does to the cached profile
#[derive(Clone, Copy, PartialEq, Eq)]
enum Profile {
    Keep,
    Clear,
}

struct Inner {
    state: Mutex<SessionState>,
    api: Arc<dyn AuthApi>,
    store: Arc<dyn TokenStore>,
    injector: AuthorizationInjector,
    scheduler: RenewalScheduler,
    in_flight: tokio::sync::Mutex<()>,
    /// Orders storage writes without holding `state` during I/O
    persist_lock: Mutex<()>,
}

/// Handle to the session. Clone is cheap and every clone sees the same state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create an empty session. Call [`restore`](Self::restore) to pick up
    /// tokens left by an earlier run.
    pub fn new(api: Arc<dyn AuthApi>, store: Arc<dyn TokenStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SessionState::default()),
                api,
                store,
                injector: AuthorizationInjector::new(),
                scheduler: RenewalScheduler::new(),
                in_flight: tokio::sync::Mutex::new(()),
                persist_lock: Mutex::new(()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Derived state
    // =========================================================================

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state();
        SessionSnapshot {
            tokens: state.tokens.clone(),
            user: state.user.clone(),
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.state().tokens.as_ref().map(|t| t.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state().tokens.as_ref().map(|t| t.refresh_token.clone())
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.state().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().tokens.is_some()
    }

    pub fn is_admin(&self) -> bool {
        self.state().user.as_ref().map(|u| u.is_admin()).unwrap_or(false)
    }

    /// Live feed of the current access token for `ApiClient::with_bearer`
    pub fn bearer(&self) -> BearerFeed {
        self.inner.injector.subscribe()
    }

    /// A client sharing `base`'s connection pool that always carries the
    /// session's current token
    pub fn client(&self, base: &ApiClient) -> ApiClient {
        base.with_bearer(self.bearer())
    }

    pub fn authorization_header(&self) -> Option<String> {
        self.inner.injector.header_value()
    }

    pub fn renewal_armed(&self) -> bool {
        self.inner.scheduler.is_armed()
    }

    pub fn renewal_due_in(&self) -> Option<Duration> {
        self.inner.scheduler.due_in()
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Rehydrate from storage. Both slots must be present; half a pair is
    /// discarded. A restored session is verified by loading the profile.
    ///
    /// Returns whether a session was restored and verified.
    pub async fn restore(&self) -> Result<bool, SessionError> {
        let _guard = self.inner.in_flight.lock().await;

        let access = self.load_slot(TokenSlot::Access);
        let refresh = self.load_slot(TokenSlot::Refresh);

        match (access, refresh) {
            (Some(access), Some(refresh)) => {
                debug!("Restoring session from storage");
                self.transition(None, Some(TokenPair::new(access, refresh)), Profile::Clear);
                Ok(self.load_profile().await?.is_some())
            }
            (None, None) => {
                debug!("No stored session");
                Ok(false)
            }
            _ => {
                warn!("Stored token pair is incomplete, discarding");
                self.transition(None, None, Profile::Clear);
                Ok(false)
            }
        }
    }

    /// Install a freshly issued pair, then verify it by loading the profile.
    /// If the profile cannot be loaded the session is torn down again.
    pub async fn login(
        &self,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
    ) -> Result<UserProfile, SessionError> {
        let _guard = self.inner.in_flight.lock().await;
        self.login_locked(TokenPair::new(access_token, refresh_token)).await
    }

    /// Authenticate with email and password, then proceed as [`login`](Self::login).
    /// A rejected sign-in leaves the current state untouched.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserProfile, SessionError> {
        let _guard = self.inner.in_flight.lock().await;
        let pair = self
            .inner
            .api
            .authenticate(email, password)
            .await
            .map_err(SessionError::SignIn)?;
        self.login_locked(pair).await
    }

    async fn login_locked(&self, pair: TokenPair) -> Result<UserProfile, SessionError> {
        self.transition(None, Some(pair), Profile::Clear);
        info!("Session started");
        self.load_profile().await?.ok_or(SessionError::Superseded)
    }

    /// Clear everything synchronously and cancel any pending renewal.
    pub fn logout(&self) {
        let was_authenticated = self.is_authenticated();
        self.transition(None, None, Profile::Clear);
        if was_authenticated {
            info!("Session ended");
        }
    }

    /// Replace both tokens, keeping the cached profile.
    pub fn rotate_tokens(&self, access_token: impl Into<String>, refresh_token: impl Into<String>) {
        self.transition(None, Some(TokenPair::new(access_token, refresh_token)), Profile::Keep);
    }

    /// Reload the profile for the current access token. No-op when logged
    /// out; a failure ends the session.
    pub async fn fetch_current_user(&self) -> Result<Option<UserProfile>, SessionError> {
        let _guard = self.inner.in_flight.lock().await;
        self.load_profile().await
    }

    /// Exchange the refresh token for a new pair. No-op when logged out;
    /// any failure ends the session. Never retried.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        self.refresh_from(None).await
    }

    /// `expected_epoch` pins a timer-driven renewal to the session that
    /// armed it.
    async fn refresh_from(&self, expected_epoch: Option<u64>) -> Result<(), SessionError> {
        let _guard = self.inner.in_flight.lock().await;

        let (epoch, refresh_token) = {
            let state = self.state();
            if expected_epoch.is_some_and(|expected| expected != state.epoch) {
                debug!("Renewal superseded before it started");
                return Err(SessionError::Superseded);
            }
            match state.tokens.as_ref() {
                Some(tokens) => (state.epoch, tokens.refresh_token.clone()),
                None => return Ok(()),
            }
        };

        match self.inner.api.refresh(&refresh_token).await {
            Ok(pair) => {
                if self.transition(Some(epoch), Some(pair), Profile::Keep).is_none() {
                    debug!("Discarding renewed tokens for a session that has changed");
                    return Err(SessionError::Superseded);
                }
                info!("Access token renewed");
                Ok(())
            }
            Err(e) => {
                if self.transition(Some(epoch), None, Profile::Clear).is_none() {
                    return Err(SessionError::Superseded);
                }
                warn!(error = %e, rejected = e.is_rejection(), "Token renewal failed, session ended");
                Err(SessionError::Refresh(e))
            }
        }
    }

    /// Caller holds the in-flight guard.
    async fn load_profile(&self) -> Result<Option<UserProfile>, SessionError> {
        let (epoch, access_token) = {
            let state = self.state();
            match state.tokens.as_ref() {
                Some(tokens) => (state.epoch, tokens.access_token.clone()),
                None => return Ok(None),
            }
        };

        match self.inner.api.current_user(&access_token).await {
            Ok(user) => {
                let mut state = self.state();
                if state.epoch != epoch {
                    return Err(SessionError::Superseded);
                }
                debug!(user_id = %user.id, role = %user.role, "Profile loaded");
                state.user = Some(user.clone());
                Ok(Some(user))
            }
            Err(e) => {
                if self.transition(Some(epoch), None, Profile::Clear).is_none() {
                    return Err(SessionError::Superseded);
                }
                warn!(error = %e, rejected = e.is_rejection(), "Profile load failed, session ended");
                Err(SessionError::ProfileLoad(e))
            }
        }
    }

    /// The only place session state changes tokens. Under the state lock:
    /// swap the pair, bump the epoch, update the injector, re-arm the timer.
    /// Storage is written after the state lock is released, under a
    /// separate lock taken before the release so writes land in transition
    /// order. With `expected_epoch` set, nothing happens unless the session
    /// is still the one the caller started from; returns the new epoch.
    fn transition(
        &self,
        expected_epoch: Option<u64>,
        tokens: Option<TokenPair>,
        profile: Profile,
    ) -> Option<u64> {
        let mut state = self.state();
        if expected_epoch.is_some_and(|expected| expected != state.epoch) {
            return None;
        }

        state.epoch += 1;
        if tokens.is_none() || profile == Profile::Clear {
            state.user = None;
        }
        state.tokens = tokens;

        let access = state.tokens.as_ref().map(|t| t.access_token.clone());
        let refresh = state.tokens.as_ref().map(|t| t.refresh_token.clone());
        self.inner.injector.set(access.as_deref());
        self.reschedule(state.tokens.as_ref(), state.epoch);
        let epoch = state.epoch;

        let _persisting = self
            .inner
            .persist_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(state);

        self.persist(TokenSlot::Access, access.as_deref());
        self.persist(TokenSlot::Refresh, refresh.as_deref());
        Some(epoch)
    }

    fn reschedule(&self, tokens: Option<&TokenPair>, epoch: u64) {
        let Some(tokens) = tokens else {
            self.inner.scheduler.cancel();
            return;
        };

        let Some(expiry) = decode_expiry(&tokens.access_token) else {
            // No readable expiry: the token is treated as non-expiring and
            // the server's rejection will surface on a later request.
            debug!("Access token has no readable expiry, renewal not scheduled");
            self.inner.scheduler.cancel();
            return;
        };

        let delay = renewal_delay(expiry, Utc::now());
        debug!(%expiry, delay_ms = delay.as_millis() as u64, "Scheduling renewal");

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.scheduler.arm(delay, move || {
            async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let session = SessionManager { inner };
                if let Err(e) = session.refresh_from(Some(epoch)).await {
                    debug!(error = %e, "Scheduled renewal did not complete");
                }
            }
            .boxed()
        });
    }

    fn persist(&self, slot: TokenSlot, value: Option<&str>) {
        if let Err(e) = self.inner.store.write(slot, value) {
            warn!(error = %e, slot = slot.key(), "Failed to persist token");
        }
    }

    fn load_slot(&self, slot: TokenSlot) -> Option<String> {
        match self.inner.store.load(slot) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, slot = slot.key(), "Failed to read stored token");
                None
            }
        }
    }
}
