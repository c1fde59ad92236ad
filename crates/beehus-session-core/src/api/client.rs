//! HTTP client for the Beehus REST API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;

use crate::config::Config;
use crate::models::{TokenPair, TokenResponse, UserProfile};

use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Login endpoint (form-encoded email/password)
const LOGIN_PATH: &str = "/auth/login";

/// Token renewal endpoint
const REFRESH_PATH: &str = "/auth/refresh";

/// Profile of the bearer of the current access token
const CURRENT_USER_PATH: &str = "/users/me";

/// Shared, observable bearer token. `None` means "send no Authorization header".
pub type BearerFeed = watch::Receiver<Option<Arc<String>>>;

/// API client for the Beehus backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Arc<str>,
    bearer: BearerFeed,
}

impl ApiClient {
    /// Create a client without credentials
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let (_, bearer) = watch::channel(None);

        Ok(Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            bearer,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.api_base_url,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Create a client pinned to one token, sharing the connection pool.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        let (_, bearer) = watch::channel(Some(Arc::new(token.into())));
        Self {
            client: self.client.clone(),
            base_url: Arc::clone(&self.base_url),
            bearer,
        }
    }

    /// Create a client that follows the session's current access token.
    /// Every request reads the latest value, so renewals and logouts apply
    /// to clients handed out earlier.
    pub fn with_bearer(&self, bearer: BearerFeed) -> Self {
        Self {
            client: self.client.clone(),
            base_url: Arc::clone(&self.base_url),
            bearer,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// The token the next request will carry, if any
    pub fn bearer_token(&self) -> Option<Arc<String>> {
        self.bearer.borrow().clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = self.bearer_token() {
            headers.insert(header::AUTHORIZATION, bearer_header(&token)?);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn parse_json<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse {}: {}", what, e)))
    }

    /// Authorized GET returning JSON
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self
            .client
            .get(self.url(path))
            .headers(self.auth_headers()?)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        Self::parse_json(response, path).await
    }

    /// Authorized POST with a JSON body returning JSON
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let response = self
            .client
            .post(self.url(path))
            .headers(self.auth_headers()?)
            .json(body)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        Self::parse_json(response, path).await
    }

    // ===== Auth Endpoints =====

    /// Exchange email and password for a token pair
    pub async fn post_login(&self, email: &str, password: &str) -> Result<TokenPair, ApiError> {
        debug!(email = email, "Sending login request");
        let response = self
            .client
            .post(self.url(LOGIN_PATH))
            .header(header::ACCEPT, "application/json")
            .form(&[("username", email), ("password", password)])
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let tokens: TokenResponse = Self::parse_json(response, "login response").await?;
        Ok(tokens.into())
    }

    /// Trade a refresh token for a new pair. Never retried.
    pub async fn post_refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        debug!("Sending token refresh request");
        let response = self
            .client
            .post(self.url(REFRESH_PATH))
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let tokens: TokenResponse = Self::parse_json(response, "refresh response").await?;
        Ok(tokens.into())
    }

    /// Load the profile for an explicit access token, independent of the
    /// client's own bearer feed (the token may not be installed yet).
    pub async fn fetch_current_user(&self, access_token: &str) -> Result<UserProfile, ApiError> {
        let response = self
            .client
            .get(self.url(CURRENT_USER_PATH))
            .header(header::AUTHORIZATION, bearer_header(access_token)?)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        Self::parse_json(response, "user profile").await
    }
}

fn bearer_header(token: &str) -> Result<header::HeaderValue, ApiError> {
    let mut value = header::HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| ApiError::InvalidToken)?;
    value.set_sensitive(true);
    Ok(value)
}
