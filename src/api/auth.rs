use reqwest::Response;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::auth::{extract_bearer, mask_token};
use crate::error::{ApiError, HttpError, Result};
use crate::http_client::{to_json, ApiClient, OutboundRequest};
use crate::models::{
    CheckEmailResponse, LoginRequest, LoginResponse, MessageResponse, SendVerificationRequest,
    SignupRequest, SignupResponse, VerifyEmailRequest,
};

const LOGIN_PATH: &str = "v1/auth/login";
const SIGNUP_PATH: &str = "v1/auth/signup";
const CHECK_EMAIL_PATH: &str = "v1/auth/check-email";
const SEND_VERIFICATION_PATH: &str = "v1/auth/send-verification";
const VERIFY_EMAIL_PATH: &str = "v1/auth/verify-email";
const LOGOUT_PATH: &str = "v1/auth/logout";

/// Auth endpoints
pub struct AuthApi {
    client: Arc<ApiClient>,
}

impl AuthApi {
    pub fn new(client: Arc<ApiClient>) -> Self {
        Self { client }
    }

    /// Log in; the issued access token becomes the current credential
    pub async fn login(&self, request: &LoginRequest) -> Result<LoginResponse> {
        let outbound = OutboundRequest::post(LOGIN_PATH).with_json(to_json(request)?);
        let response = self.client.send(&outbound).await?;
        let data: LoginResponse = self.adopt_token(response).await?;
        tracing::info!(user_id = data.user_id, "Logged in");
        Ok(data)
    }

    /// Create an account. No token is issued until the email is verified.
    pub async fn signup(&self, request: &SignupRequest) -> Result<SignupResponse> {
        self.client.post_json(SIGNUP_PATH, request).await
    }

    pub async fn check_email(&self, email: &str) -> Result<CheckEmailResponse> {
        let outbound = OutboundRequest::get(CHECK_EMAIL_PATH).with_query("email", email);
        self.client.execute_json(&outbound).await
    }

    pub async fn send_verification(
        &self,
        request: &SendVerificationRequest,
    ) -> Result<MessageResponse> {
        self.client.post_json(SEND_VERIFICATION_PATH, request).await
    }

    /// Verify the emailed code; success logs the user in
    pub async fn verify_email(&self, request: &VerifyEmailRequest) -> Result<LoginResponse> {
        let outbound = OutboundRequest::post(VERIFY_EMAIL_PATH).with_json(to_json(request)?);
        let response = self.client.send(&outbound).await?;
        let data: LoginResponse = self.adopt_token(response).await?;
        tracing::info!(user_id = data.user_id, "Email verified, logged in");
        Ok(data)
    }

    /// Log out on the server, then drop the local session regardless of outcome
    pub async fn logout(&self) -> Result<MessageResponse> {
        let result = self
            .client
            .post_json(LOGOUT_PATH, &serde_json::json!({}))
            .await;
        self.client.end_session();

        if let Err(e) = &result {
            tracing::warn!("Server logout failed, local session cleared anyway: {}", e);
        }
        result
    }

    /// Read a token-issuing response: store the bearer token, decode the body
    async fn adopt_token<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        if !response.status().is_success() {
            return Err(ApiError::Server(HttpError::from_response(response).await));
        }

        let token = extract_bearer(response.headers()).ok_or(ApiError::MissingToken)?;
        self.client.remember_cookies(response.headers());
        let text = response.text().await?;
        let data = serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))?;

        tracing::debug!("Adopting access token {}", mask_token(&token));
        self.client.start_session(token);
        Ok(data)
    }
}
