//! Client-side session management for the Beehus API.
//!
//! Holds the access/refresh token pair, keeps the signed-in user's profile
//! in sync with it and renews the access token shortly before it expires.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod token;

pub use api::{ApiClient, ApiError, AuthApi};
pub use auth::{RouteAccess, SessionError, SessionManager, SessionSnapshot};
pub use config::Config;
pub use models::{Role, TokenPair, UserProfile};
