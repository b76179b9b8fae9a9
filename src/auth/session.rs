// Session termination side effect

use crate::error::RefreshFailure;

/// Notified once per failed refresh, after the credential store is cleared
pub trait SessionObserver: Send + Sync {
    fn session_terminated(&self, failure: &RefreshFailure);
}

/// Sends the user back to the unauthenticated entry point
pub struct RedirectToLogin {
    login_path: String,
}

impl RedirectToLogin {
    pub fn new(login_path: impl Into<String>) -> Self {
        Self {
            login_path: login_path.into(),
        }
    }

    pub fn login_path(&self) -> &str {
        &self.login_path
    }
}

impl Default for RedirectToLogin {
    fn default() -> Self {
        Self::new("/login")
    }
}

impl SessionObserver for RedirectToLogin {
    fn session_terminated(&self, failure: &RefreshFailure) {
        tracing::warn!(
            reason = %failure,
            "Session terminated, redirecting to {}",
            self.login_path
        );
    }
}
