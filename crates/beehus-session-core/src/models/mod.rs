//! Data models exchanged with the Beehus API.
//!
//! - `UserProfile`, `Role`: the cached profile of the signed-in user
//! - `TokenPair`, `TokenResponse`: credential pairs issued by the auth endpoints

pub mod user;

pub use user::{Role, TokenPair, TokenResponse, UserProfile};
