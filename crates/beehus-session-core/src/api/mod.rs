//! REST client for the Beehus auth and user endpoints.
//!
//! `ApiClient` carries its bearer token explicitly: either a fixed token
//! (`with_token`) or a live feed from the session's authorization injector
//! (`with_bearer`). There is no process-wide default header.
//!
//! The session store talks to the server through the `AuthApi` trait so the
//! renewal flow can be exercised without a network.

pub mod client;
pub mod error;

use async_trait::async_trait;

use crate::models::{TokenPair, UserProfile};

pub use client::ApiClient;
pub use error::ApiError;

/// The three server calls the session lifecycle depends on.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange email and password for a token pair (`POST /auth/login`)
    async fn authenticate(&self, email: &str, password: &str) -> Result<TokenPair, ApiError>;

    /// Trade a refresh token for a new pair (`POST /auth/refresh`)
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError>;

    /// Load the profile the given access token belongs to (`GET /users/me`)
    async fn current_user(&self, access_token: &str) -> Result<UserProfile, ApiError>;
}

#[async_trait]
impl AuthApi for ApiClient {
    async fn authenticate(&self, email: &str, password: &str) -> Result<TokenPair, ApiError> {
        self.post_login(email, password).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError> {
        self.post_refresh(refresh_token).await
    }

    async fn current_user(&self, access_token: &str) -> Result<UserProfile, ApiError> {
        self.fetch_current_user(access_token).await
    }
}
