// Typed wrappers over Janchwi API endpoints

pub mod auth;

pub use auth::AuthApi;
