// Request/response hook pipeline run by the dispatcher

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Request, StatusCode};
use std::sync::Arc;

use crate::auth::CredentialStore;
use crate::http_client::OutboundRequest;

/// Paths whose own 401 means "wrong credentials", never "expired"
pub const SELF_AUTH_PATHS: &[&str] = &["/auth/login", "/auth/signup"];

/// Runs before every dispatch, on the rendered request
pub trait BeforeRequest: Send + Sync {
    fn before_request(&self, request: &mut Request);
}

/// How a response should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pass through to the caller unchanged
    Ok,
    /// Access credential expired: refresh and retry once
    Expired,
    /// Credentials submitted to a self-auth endpoint were rejected
    AuthEndpointFailure,
}

/// Runs after every first-attempt response
pub trait AfterResponse: Send + Sync {
    fn after_response(&self, request: &OutboundRequest, status: StatusCode) -> Verdict;
}

/// Attaches the current access credential as a bearer token
pub struct BearerAuth {
    store: CredentialStore,
}

impl BearerAuth {
    pub fn new(store: CredentialStore) -> Self {
        Self { store }
    }
}

impl BeforeRequest for BearerAuth {
    fn before_request(&self, request: &mut Request) {
        let Some(token) = self.store.get() else {
            return;
        };
        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(value) => {
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            Err(_) => tracing::warn!("Stored access token is not a valid header value, skipping"),
        }
    }
}

/// Classifies 401 responses
#[derive(Debug, Clone)]
pub struct ExpiryDetector {
    self_auth_paths: Vec<String>,
}

impl ExpiryDetector {
    pub fn new<I, S>(self_auth_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            self_auth_paths: self_auth_paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_self_auth(&self, path: &str) -> bool {
        let normalized = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        self.self_auth_paths
            .iter()
            .any(|p| normalized.contains(p.as_str()))
    }

    pub fn classify(&self, path: &str, status: StatusCode) -> Verdict {
        if status != StatusCode::UNAUTHORIZED {
            return Verdict::Ok;
        }
        if self.is_self_auth(path) {
            Verdict::AuthEndpointFailure
        } else {
            Verdict::Expired
        }
    }
}

impl Default for ExpiryDetector {
    fn default() -> Self {
        Self::new(SELF_AUTH_PATHS.iter().copied())
    }
}

impl AfterResponse for ExpiryDetector {
    fn after_response(&self, request: &OutboundRequest, status: StatusCode) -> Verdict {
        self.classify(request.path(), status)
    }
}

/// Ordered hook lists composed by the dispatcher
#[derive(Clone, Default)]
pub struct Pipeline {
    before: Vec<Arc<dyn BeforeRequest>>,
    after: Vec<Arc<dyn AfterResponse>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before(mut self, hook: Arc<dyn BeforeRequest>) -> Self {
        self.before.push(hook);
        self
    }

    pub fn after(mut self, hook: Arc<dyn AfterResponse>) -> Self {
        self.after.push(hook);
        self
    }

    pub fn run_before(&self, request: &mut Request) {
        for hook in &self.before {
            hook.before_request(request);
        }
    }

    /// First non-`Ok` verdict wins
    pub fn verdict(&self, request: &OutboundRequest, status: StatusCode) -> Verdict {
        self.after
            .iter()
            .map(|hook| hook.after_response(request, status))
            .find(|v| *v != Verdict::Ok)
            .unwrap_or(Verdict::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use reqwest::{Method, Url};

    fn raw_request() -> Request {
        Request::new(
            Method::GET,
            Url::parse("http://localhost:8080/api/v1/alcohols").unwrap(),
        )
    }

    #[test]
    fn test_bearer_attached_when_present() {
        let store = CredentialStore::in_memory();
        let hook = BearerAuth::new(store.clone());

        let mut request = raw_request();
        hook.before_request(&mut request);
        assert!(request.headers().get(AUTHORIZATION).is_none());

        store.set("T1".to_string());
        let mut request = raw_request();
        hook.before_request(&mut request);
        assert_eq!(request.headers().get(AUTHORIZATION).unwrap(), "Bearer T1");
    }

    #[test]
    fn test_invalid_token_skipped() {
        let store = CredentialStore::in_memory();
        store.set("bad\ntoken".to_string());

        let mut request = raw_request();
        BearerAuth::new(store).before_request(&mut request);
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_classify() {
        let detector = ExpiryDetector::default();
        assert_eq!(
            detector.classify("v1/auth/login", StatusCode::UNAUTHORIZED),
            Verdict::AuthEndpointFailure
        );
        assert_eq!(
            detector.classify("/v1/auth/signup", StatusCode::UNAUTHORIZED),
            Verdict::AuthEndpointFailure
        );
        assert_eq!(
            detector.classify("v1/users/me", StatusCode::UNAUTHORIZED),
            Verdict::Expired
        );
        assert_eq!(
            detector.classify("v1/auth/verify-email", StatusCode::UNAUTHORIZED),
            Verdict::Expired
        );
        assert_eq!(
            detector.classify("v1/users/me", StatusCode::INTERNAL_SERVER_ERROR),
            Verdict::Ok
        );
        assert_eq!(
            detector.classify("v1/auth/login", StatusCode::FORBIDDEN),
            Verdict::Ok
        );
    }

    #[test]
    fn test_pipeline_first_verdict_wins() {
        struct AlwaysExpired;
        impl AfterResponse for AlwaysExpired {
            fn after_response(&self, _: &OutboundRequest, _: StatusCode) -> Verdict {
                Verdict::Expired
            }
        }

        let pipeline = Pipeline::new()
            .after(Arc::new(ExpiryDetector::default()))
            .after(Arc::new(AlwaysExpired));
        let login = OutboundRequest::post("v1/auth/login");

        assert_eq!(
            pipeline.verdict(&login, StatusCode::UNAUTHORIZED),
            Verdict::AuthEndpointFailure
        );
        assert_eq!(pipeline.verdict(&login, StatusCode::OK), Verdict::Expired);
        assert_eq!(Pipeline::new().verdict(&login, StatusCode::UNAUTHORIZED), Verdict::Ok);
    }

    proptest! {
        #[test]
        fn prop_self_auth_never_expires(
            prefix in "[a-z0-9/]{0,12}",
            endpoint in prop::sample::select(vec!["/auth/login", "/auth/signup"]),
            suffix in "[a-z0-9?=&]{0,12}",
            status in 100u16..600,
        ) {
            let detector = ExpiryDetector::default();
            let path = format!("{}{}{}", prefix, endpoint, suffix);
            let status = StatusCode::from_u16(status).unwrap();
            prop_assert_ne!(detector.classify(&path, status), Verdict::Expired);
        }

        #[test]
        fn prop_only_401_is_classified(path in "[a-z0-9/-]{0,24}", status in 100u16..600) {
            prop_assume!(status != 401);
            let detector = ExpiryDetector::default();
            let status = StatusCode::from_u16(status).unwrap();
            prop_assert_eq!(detector.classify(&path, status), Verdict::Ok);
        }
    }
}
