// Data models for the Janchwi API

pub mod auth;

pub use auth::{
    CheckEmailResponse, Gender, LoginRequest, LoginResponse, MessageResponse,
    RefreshTokenResponse, SendVerificationRequest, SignupRequest, SignupResponse,
    VerifyEmailRequest,
};
