// Error handling module
// Defines the client error taxonomy and user-facing message extraction

use serde::Deserialize;
use thiserror::Error;

/// Error body returned by the API on failure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    pub success: Option<bool>,
    pub message: Option<String>,
    pub status: Option<u16>,
    /// Machine-readable error code (ACCOUNT_LOCKED, EMAIL_NOT_VERIFIED, ...)
    pub code: Option<String>,
    pub timestamp: Option<String>,
    pub errors: Option<Vec<FieldError>>,
}

/// Per-field validation error
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Non-success HTTP response, with the best message we could extract
#[derive(Debug, Clone, PartialEq)]
pub struct HttpError {
    pub status: u16,
    pub message: String,
    pub code: Option<String>,
    pub field_errors: Vec<FieldError>,
}

impl HttpError {
    /// Build from a status code and raw body text.
    /// Never fails: an unparseable body falls back to the status message table.
    pub fn from_parts(status: u16, body: &str) -> Self {
        let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();

        let message = parsed
            .message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| fallback_message(status));

        Self {
            status,
            message,
            code: parsed.code,
            field_errors: parsed.errors.unwrap_or_default(),
        }
    }

    /// Consume a response and build the error from its status and body
    pub async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Self::from_parts(status, &body)
    }

    /// Account locked after too many failed logins
    pub fn is_account_locked(&self) -> bool {
        if self.status != 403 {
            return false;
        }
        if self.code.as_deref() == Some("ACCOUNT_LOCKED") {
            return true;
        }
        // Older servers only send the localized message
        ["차단", "잠금", "잠겼습니다"]
            .iter()
            .any(|kw| self.message.contains(kw))
    }

    /// Login rejected because the email address is not verified yet
    pub fn is_email_not_verified(&self) -> bool {
        if self.status != 403 {
            return false;
        }
        if self.code.as_deref() == Some("EMAIL_NOT_VERIFIED") {
            return true;
        }
        self.message.contains("이메일 인증")
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.status, self.message)
    }
}

/// Generic message for a status code when the server gave us nothing usable
pub fn fallback_message(status: u16) -> String {
    match status {
        400 => "Invalid request.".to_string(),
        401 => "Authentication is required.".to_string(),
        403 => "You do not have permission.".to_string(),
        404 => "The requested resource was not found.".to_string(),
        409 => "The data already exists.".to_string(),
        429 => "Too many requests. Please try again later.".to_string(),
        500 => "A server error occurred.".to_string(),
        502 => "A gateway error occurred.".to_string(),
        503 => "The service is temporarily unavailable.".to_string(),
        other => format!("An error occurred. ({})", other),
    }
}

/// Outcome of a failed refresh, shared by every caller awaiting it
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Token refresh failed: {message}")]
pub struct RefreshFailure {
    /// HTTP status of the refresh call, if one was received
    pub status: Option<u16>,
    pub message: String,
}

impl RefreshFailure {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Errors surfaced by the API client
#[derive(Error, Debug)]
pub enum ApiError {
    /// Network unreachable, timeout, or other transport failure
    #[error("Transport error ({}): {0}", transport_error_kind(.0))]
    Transport(#[from] reqwest::Error),

    /// 401 from a login/signup endpoint: the submitted credentials were wrong
    #[error("Authentication failed: {0}")]
    AuthEndpointFailure(HttpError),

    /// The session could not be renewed
    #[error("Session expired: {0}")]
    RefreshFailed(#[from] RefreshFailure),

    /// Any other error status, surfaced verbatim
    #[error("API error: {0}")]
    Server(HttpError),

    /// Successful auth response without an access token
    #[error("Access token not found in response")]
    MissingToken,

    /// Response body did not match the expected shape
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// HTTP status associated with this error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::AuthEndpointFailure(e) | ApiError::Server(e) => Some(e.status),
            ApiError::RefreshFailed(f) => f.status,
            ApiError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// The parsed HTTP error, for endpoint and server failures
    pub fn http_error(&self) -> Option<&HttpError> {
        match self {
            ApiError::AuthEndpointFailure(e) | ApiError::Server(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the request never got a response from the server
    pub fn is_network_error(&self) -> bool {
        match self {
            ApiError::Transport(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }

    /// Message suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            ApiError::AuthEndpointFailure(e) | ApiError::Server(e) => e.message.clone(),
            ApiError::RefreshFailed(_) => {
                "Your session has expired. Please log in again.".to_string()
            }
            ApiError::Transport(e) if e.is_timeout() => {
                "The request timed out. Please try again.".to_string()
            }
            ApiError::Transport(_) => {
                "Could not reach the server. Check your network connection.".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Categorize a transport error for logs
pub fn transport_error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
