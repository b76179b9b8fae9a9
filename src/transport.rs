// HTTP transport: shared reqwest client and refresh-cookie persistence

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, SET_COOKIE};
use reqwest::{Client, Url};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::persist::{SessionKv, COOKIES_KEY};

/// Join a base URL and a relative API path with exactly one slash
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Build the shared HTTP client.
/// The cookie jar carries the HTTP-only refresh credential on every call.
pub fn build_client(
    jar: Arc<Jar>,
    connect_timeout: Duration,
    request_timeout: Duration,
) -> Result<Client> {
    Client::builder()
        .cookie_provider(jar)
        .connect_timeout(connect_timeout)
        .timeout(request_timeout)
        .user_agent(concat!("janchwi-client/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")
}

/// Cookie jar for the API origin, optionally mirrored into the session slot.
///
/// The mirror keeps the raw `Set-Cookie` lines, one per cookie name, so
/// `Secure`, `SameSite` and the expiry survive a restart. `Max-Age` is pinned
/// to an absolute `Expires` when recorded.
pub struct CookieMirror {
    jar: Arc<Jar>,
    origin: Url,
    durable: Option<Arc<dyn SessionKv>>,
    recorded: Mutex<BTreeMap<String, String>>,
}

impl CookieMirror {
    /// Create the jar and restore any cookies saved for `origin`
    pub fn new(origin: Url, durable: Option<Arc<dyn SessionKv>>) -> Self {
        let jar = Arc::new(Jar::default());
        let mut recorded = BTreeMap::new();

        if let Some(kv) = &durable {
            match kv.get(COOKIES_KEY) {
                Ok(Some(saved)) => match serde_json::from_str::<Vec<String>>(&saved) {
                    Ok(lines) => {
                        for line in lines {
                            jar.add_cookie_str(&line, &origin);
                            if let Some(name) = cookie_name(&line) {
                                recorded.insert(name.to_string(), line);
                            }
                        }
                        tracing::debug!("Restored {} cookie(s) for {}", recorded.len(), origin);
                    }
                    Err(e) => tracing::warn!("Ignoring unreadable saved cookies: {}", e),
                },
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to restore cookies: {:#}", e),
            }
        }

        Self {
            jar,
            origin,
            durable,
            recorded: Mutex::new(recorded),
        }
    }

    pub fn jar(&self) -> Arc<Jar> {
        self.jar.clone()
    }

    /// Cookie header the jar would send to the API origin
    pub fn header_value(&self) -> Option<String> {
        self.jar
            .cookies(&self.origin)
            .and_then(|v| v.to_str().ok().map(str::to_string))
    }

    /// Record the `Set-Cookie` lines of a response and persist the result.
    /// The jar itself already took them when the response arrived.
    pub fn record(&self, headers: &HeaderMap) {
        let lines: Vec<&str> = headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if lines.is_empty() {
            return;
        }

        let snapshot = {
            let mut recorded = self.recorded.lock();
            let now = Utc::now();
            for line in lines {
                let Some(name) = cookie_name(line) else {
                    continue;
                };
                match pin_expiry(line, now) {
                    Some(pinned) => recorded.insert(name.to_string(), pinned),
                    None => recorded.remove(name),
                };
            }
            recorded.values().cloned().collect::<Vec<_>>()
        };

        self.persist(&snapshot);
    }

    /// Drop the recorded cookies (the server expires the live cookie on logout)
    pub fn forget(&self) {
        self.recorded.lock().clear();
        if let Some(kv) = &self.durable {
            if let Err(e) = kv.delete(COOKIES_KEY) {
                tracing::warn!("Failed to remove persisted cookies: {:#}", e);
            }
        }
    }

    fn persist(&self, lines: &[String]) {
        let Some(kv) = &self.durable else {
            return;
        };

        let result = if lines.is_empty() {
            kv.delete(COOKIES_KEY)
        } else {
            serde_json::to_string(lines)
                .context("Failed to encode cookies")
                .and_then(|encoded| kv.put(COOKIES_KEY, &encoded))
        };
        if let Err(e) = result {
            tracing::warn!("Failed to persist cookies: {:#}", e);
        }
    }
}

/// Name part of a `Set-Cookie` line
fn cookie_name(line: &str) -> Option<&str> {
    let (name, _) = line.split(';').next()?.split_once('=')?;
    let name = name.trim();
    (!name.is_empty()).then_some(name)
}

/// Rewrite `Max-Age` as an absolute `Expires` relative to `now`.
/// Returns `None` for a line that deletes the cookie.
fn pin_expiry(line: &str, now: DateTime<Utc>) -> Option<String> {
    let mut parts = line.split(';').map(str::trim).filter(|p| !p.is_empty());
    let pair = parts.next()?;

    let mut attrs = Vec::new();
    let mut max_age = None;
    let mut expires = None;
    for attr in parts {
        let lower = attr.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("max-age=") {
            max_age = value.trim().parse::<i64>().ok();
        } else if lower.starts_with("expires=") {
            expires = Some(attr);
        } else {
            attrs.push(attr.to_string());
        }
    }

    match max_age {
        Some(secs) if secs <= 0 => return None,
        Some(secs) => {
            let at = now + chrono::Duration::seconds(secs);
            attrs.push(format!("Expires={}", at.format("%a, %d %b %Y %H:%M:%S GMT")));
        }
        None => attrs.extend(expires.map(str::to_string)),
    }

    let mut pinned = pair.to_string();
    for attr in attrs {
        pinned.push_str("; ");
        pinned.push_str(&attr);
    }
    Some(pinned)
}
