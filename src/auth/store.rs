// Process-wide access credential slot

use parking_lot::RwLock;
use std::sync::Arc;

use super::persist::{SessionKv, ACCESS_TOKEN_KEY};

/// Holds the current short-lived access credential.
///
/// Cloning yields another handle to the same slot. When a durable slot is
/// attached, every `set`/`clear` is mirrored into it; mirror failures are
/// logged and never surface to callers.
#[derive(Clone, Default)]
pub struct CredentialStore {
    token: Arc<RwLock<Option<String>>>,
    durable: Option<Arc<dyn SessionKv>>,
}

impl CredentialStore {
    /// Empty store with no durable mirror
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Store mirrored into `durable`, initialized from whatever it holds
    pub fn load(durable: Arc<dyn SessionKv>) -> Self {
        let initial = match durable.get(ACCESS_TOKEN_KEY) {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("Failed to restore access token: {:#}", e);
                None
            }
        };

        if initial.is_some() {
            tracing::debug!("Restored access token from session storage");
        }

        Self {
            token: Arc::new(RwLock::new(initial)),
            durable: Some(durable),
        }
    }

    pub fn get(&self) -> Option<String> {
        self.token.read().clone()
    }

    pub fn set(&self, token: String) {
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.put(ACCESS_TOKEN_KEY, &token) {
                tracing::warn!("Failed to persist access token: {:#}", e);
            }
        }
        *self.token.write() = Some(token);
    }

    pub fn clear(&self) {
        *self.token.write() = None;
        if let Some(durable) = &self.durable {
            if let Err(e) = durable.delete(ACCESS_TOKEN_KEY) {
                tracing::warn!("Failed to remove persisted access token: {:#}", e);
            }
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("authenticated", &self.is_authenticated())
            .field("durable", &self.durable.is_some())
            .finish()
    }
}

/// Shorten a token for log output
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}
