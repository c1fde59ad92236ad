use super::session::SessionSnapshot;

/// Outcome of gating a page on the session's derived flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAccess {
    Granted,
    /// No access token held
    RedirectToLogin,
    /// Signed in, but the page is admin-only
    RedirectToHome,
}

impl RouteAccess {
    pub fn check(session: &SessionSnapshot, require_admin: bool) -> Self {
        if !session.is_authenticated() {
            RouteAccess::RedirectToLogin
        } else if require_admin && !session.is_admin() {
            RouteAccess::RedirectToHome
        } else {
            RouteAccess::Granted
        }
    }

    pub fn redirect_path(self) -> Option<&'static str> {
        match self {
            RouteAccess::Granted => None,
            RouteAccess::RedirectToLogin => Some("/login"),
            RouteAccess::RedirectToHome => Some("/"),
        }
    }
}
