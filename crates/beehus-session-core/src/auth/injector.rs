use std::sync::Arc;

use tokio::sync::watch;

use crate::api::client::BearerFeed;

/// Publishes the current access token to every `ApiClient` built from
/// [`subscribe`](Self::subscribe).
///
/// Owned by the session. When no token is held the value is `None` and
/// clients omit the Authorization header entirely.
pub struct AuthorizationInjector {
    tx: watch::Sender<Option<Arc<String>>>,
}

impl AuthorizationInjector {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub fn set(&self, token: Option<&str>) {
        // send_replace never fails, even with no subscribers yet
        self.tx.send_replace(token.map(|t| Arc::new(t.to_string())));
    }

    pub fn subscribe(&self) -> BearerFeed {
        self.tx.subscribe()
    }

    /// The exact `Authorization` value outbound requests carry right now
    pub fn header_value(&self) -> Option<String> {
        self.tx
            .borrow()
            .as_ref()
            .map(|token| format!("Bearer {}", token))
    }
}

impl Default for AuthorizationInjector {
    fn default() -> Self {
        Self::new()
    }
}
