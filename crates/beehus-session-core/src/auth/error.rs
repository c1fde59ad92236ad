use thiserror::Error;

use crate::api::ApiError;

/// Why a session operation did not complete.
///
/// By the time any of these is returned the session has already been torn
/// down where required; callers only need to log or report.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Sign-in rejected: {0}")]
    SignIn(#[source] ApiError),

    #[error("Failed to load user profile: {0}")]
    ProfileLoad(#[source] ApiError),

    #[error("Token renewal failed: {0}")]
    Refresh(#[source] ApiError),

    #[error("Session changed while the request was in flight")]
    Superseded,
}
