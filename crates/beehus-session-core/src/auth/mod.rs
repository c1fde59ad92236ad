//! Session lifecycle: token pair, cached profile, proactive renewal.
//!
//! This module provides:
//! - `SessionManager`: owns the session and every transition on it
//! - `RenewalScheduler`: the single pending renewal timer
//! - `AuthorizationInjector`: feeds the current token to API clients
//! - `TokenStore` and its backends: durable token slots
//! - `RouteAccess`: page gating on the derived flags
//!
//! Access tokens are renewed 60 seconds before they expire. Any failure to
//! renew or to load the profile ends the session.

pub mod error;
pub mod guard;
pub mod injector;
pub mod scheduler;
pub mod session;
pub mod storage;

pub use error::SessionError;
pub use guard::RouteAccess;
pub use injector::AuthorizationInjector;
pub use scheduler::{renewal_delay, RenewalScheduler, MIN_RENEWAL_DELAY, RENEWAL_LEAD};
pub use session::{SessionManager, SessionSnapshot};
pub use storage::{open_store, FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenSlot, TokenStore};
