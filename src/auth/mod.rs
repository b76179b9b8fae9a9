// Authentication module
// Manages the access credential lifecycle and the shared refresh

mod coordinator;
pub mod persist;
mod refresh;
mod session;
mod store;

pub use coordinator::RefreshCoordinator;
pub use refresh::{extract_bearer, HttpRefresher, TokenRefresher};
pub use session::{RedirectToLogin, SessionObserver};
pub use store::{mask_token, CredentialStore};
