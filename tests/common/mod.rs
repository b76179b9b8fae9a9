// Mock Janchwi API server for integration tests

#![allow(dead_code)]

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use janchwi_client::auth::SessionObserver;
use janchwi_client::error::RefreshFailure;

pub const EMAIL: &str = "user@janchwi.site";
pub const PASSWORD: &str = "secret";
pub const REFRESH_COOKIE: &str = "refreshToken=cookie-1";

/// Knobs and counters shared with the request handlers
#[derive(Default)]
pub struct MockState {
    /// Delay before the refresh endpoint answers (milliseconds)
    pub refresh_delay_ms: AtomicU64,
    pub refresh_calls: AtomicU32,
    pub refresh_fails: AtomicBool,
    /// Reject refresh calls that do not carry the refresh cookie
    pub require_cookie: AtomicBool,
    /// Token minted by the refresh endpoint and accepted by the protected
    /// endpoints; `T2` when unset
    pub issued_token: Mutex<Option<String>>,
    /// Answer 401 on the protected endpoint even with a fresh token
    pub always_unauthorized: AtomicBool,
    /// Answer 503 on the protected endpoint to a fresh token
    pub unavailable_when_fresh: AtomicBool,
    /// Delay before the slow protected endpoint answers (milliseconds)
    pub slow_delay_ms: AtomicU64,
    /// Authorization headers seen by the protected endpoints, in order
    pub item_auth_headers: Mutex<Vec<String>>,
    /// Remaining 503 answers from the flaky endpoint
    pub flaky_remaining: AtomicU32,
    pub flaky_calls: AtomicU32,
}

impl MockState {
    pub fn issued_token(&self) -> String {
        self.issued_token
            .lock()
            .clone()
            .unwrap_or_else(|| "T2".to_string())
    }

    pub fn issue(&self, token: &str) {
        *self.issued_token.lock() = Some(token.to_string());
    }

    pub fn refresh_calls(&self) -> u32 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn item_auth_headers(&self) -> Vec<String> {
        self.item_auth_headers.lock().clone()
    }
}

/// Mock API server bound to an ephemeral local port
pub struct MockApiServer {
    pub state: Arc<MockState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    port: u16,
}

impl MockApiServer {
    pub async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();

        let state = Arc::new(MockState::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let app = Router::new()
            .route("/api/v1/auth/login", post(handle_login))
            .route("/api/v1/auth/refresh", post(handle_refresh))
            .route("/api/v1/items", get(handle_items))
            .route("/api/v1/slow-items", get(handle_slow_items))
            .route("/api/v1/flaky", get(handle_flaky).post(handle_flaky))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Ok(Self {
            state,
            shutdown_tx: Some(shutdown_tx),
            port,
        })
    }

    /// API base URL, including the `/api` prefix
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}/api", self.port)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockApiServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_login(Json(body): Json<Value>) -> Response {
    if body["email"] == EMAIL && body["password"] == PASSWORD {
        (
            StatusCode::OK,
            [
                (header::AUTHORIZATION, "Bearer T1".to_string()),
                (header::SET_COOKIE, format!("{}; Path=/; HttpOnly", REFRESH_COOKIE)),
            ],
            Json(json!({ "userId": 1 })),
        )
            .into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "message": "bad credentials", "status": 401 })),
        )
            .into_response()
    }
}

async fn handle_refresh(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    let delay = state.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
    }
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);

    let has_cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains(REFRESH_COOKIE))
        .unwrap_or(false);

    if state.refresh_fails.load(Ordering::SeqCst)
        || (state.require_cookie.load(Ordering::SeqCst) && !has_cookie)
    {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "refresh token expired" })),
        )
            .into_response();
    }

    let token = state.issued_token();
    (
        StatusCode::OK,
        [(header::AUTHORIZATION, format!("Bearer {}", token))],
        Json(json!({ "accessToken": token })),
    )
        .into_response()
}

async fn handle_items(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.item_auth_headers.lock().push(auth.clone());

    let fresh = auth == format!("Bearer {}", state.issued_token());
    if !fresh || state.always_unauthorized.load(Ordering::SeqCst) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "token expired" })),
        )
            .into_response();
    }
    if state.unavailable_when_fresh.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "upstream unavailable").into_response();
    }

    (StatusCode::OK, Json(json!({ "items": [1, 2, 3] }))).into_response()
}

/// Protected endpoint that answers after a delay; the token is checked on
/// arrival, so it can expire while the request is in flight
async fn handle_slow_items(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.item_auth_headers.lock().push(auth.clone());
    let arrived_fresh = auth == format!("Bearer {}", state.issued_token());

    let delay = state.slow_delay_ms.load(Ordering::SeqCst);
    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;

    if !arrived_fresh {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "token expired" })),
        )
            .into_response();
    }

    (StatusCode::OK, Json(json!({ "items": [1, 2, 3] }))).into_response()
}

async fn handle_flaky(State(state): State<Arc<MockState>>) -> Response {
    state.flaky_calls.fetch_add(1, Ordering::SeqCst);

    let remaining = state.flaky_remaining.load(Ordering::SeqCst);
    if remaining > 0 {
        state.flaky_remaining.store(remaining - 1, Ordering::SeqCst);
        return (StatusCode::SERVICE_UNAVAILABLE, "upstream unavailable").into_response();
    }

    (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
}

/// Observer that records every terminated session
#[derive(Default)]
pub struct CountingObserver {
    pub terminations: AtomicU32,
    pub last: Mutex<Option<RefreshFailure>>,
}

impl CountingObserver {
    pub fn count(&self) -> u32 {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl SessionObserver for CountingObserver {
    fn session_terminated(&self, failure: &RefreshFailure) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(failure.clone());
    }
}
