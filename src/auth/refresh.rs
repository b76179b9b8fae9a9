// Token refresh network call

use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::Client;
use std::sync::Arc;

use crate::error::{HttpError, RefreshFailure};
use crate::models::RefreshTokenResponse;
use crate::transport::CookieMirror;

/// Performs the refresh network call that mints a new access credential.
///
/// Implementations rely on whatever long-lived credential the transport
/// carries (the refresh cookie); callers never see it.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<String, RefreshFailure>;
}

/// Pull the token out of an `Authorization: Bearer ...` header
pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Refreshes against `POST {base}/v1/auth/refresh` using the cookie jar
pub struct HttpRefresher {
    client: Client,
    url: String,
    cookies: Option<Arc<CookieMirror>>,
}

impl HttpRefresher {
    pub fn new(client: Client, url: String, cookies: Option<Arc<CookieMirror>>) -> Self {
        Self {
            client,
            url,
            cookies,
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpRefresher {
    async fn refresh(&self) -> Result<String, RefreshFailure> {
        tracing::info!("Refreshing access token via {}", self.url);

        let response = self.client.post(&self.url).send().await.map_err(|e| {
            tracing::error!(
                error_kind = crate::error::transport_error_kind(&e),
                error = %e,
                "Failed to send refresh request"
            );
            RefreshFailure::new(None, format!("Failed to send refresh request: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                body = %error_text,
                "Token refresh rejected"
            );
            let error = HttpError::from_parts(status.as_u16(), &error_text);
            return Err(RefreshFailure::new(Some(status.as_u16()), error.message));
        }

        // The header is authoritative; the body is a fallback for servers
        // that only return JSON
        let header_token = extract_bearer(response.headers());
        if let Some(cookies) = &self.cookies {
            cookies.record(response.headers());
        }
        let body = response.text().await.unwrap_or_default();
        let token = header_token
            .or_else(|| {
                serde_json::from_str::<RefreshTokenResponse>(&body)
                    .ok()
                    .map(|data| data.access_token)
            })
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                RefreshFailure::new(
                    Some(status.as_u16()),
                    "Refresh response does not contain an access token",
                )
            })?;

        Ok(token)
    }
}
