use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::refresh::TokenRefresher;
use super::session::SessionObserver;
use super::store::{mask_token, CredentialStore};
use crate::error::RefreshFailure;

type RefreshResult = Result<String, RefreshFailure>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// The single refresh slot
enum RefreshState {
    Idle,
    Pending {
        /// Identifies the operation that owns the slot
        generation: u64,
        op: SharedRefresh,
    },
}

struct Inner {
    state: Mutex<RefreshState>,
    store: CredentialStore,
    refresher: Arc<dyn TokenRefresher>,
    observer: Arc<dyn SessionObserver>,
    /// Refresh network calls started so far; doubles as the generation counter
    started: AtomicU64,
}

/// Refresh coordinator
/// Guarantees at most one refresh call in flight; concurrent callers share its outcome
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: CredentialStore,
        refresher: Arc<dyn TokenRefresher>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RefreshState::Idle),
                store,
                refresher,
                observer,
                started: AtomicU64::new(0),
            }),
        }
    }

    /// Obtain a fresh access credential.
    ///
    /// Joins the pending refresh if there is one, otherwise starts it. On
    /// success the store already holds the returned credential; on failure
    /// the store has been cleared and the session observer notified, exactly
    /// once per refresh no matter how many callers were waiting.
    pub async fn refresh(&self) -> RefreshResult {
        self.renew(None).await
    }

    /// Like [`refresh`](Self::refresh), for a caller whose request was
    /// rejected while carrying `stale`.
    ///
    /// A pending refresh is always joined. With no refresh pending, a store
    /// value that already differs from `stale` was minted after the caller's
    /// request went out and is returned without a network call.
    pub async fn renew(&self, stale: Option<&str>) -> RefreshResult {
        // Check and publish under one lock with no await in between
        let op = {
            let mut state = self.inner.state.lock();
            match &*state {
                RefreshState::Pending { generation, op } => {
                    tracing::debug!(generation, "Refresh already in flight, joining it");
                    op.clone()
                }
                RefreshState::Idle => {
                    let renewed = self
                        .inner
                        .store
                        .get()
                        .filter(|current| stale.is_some_and(|s| s != current.as_str()));
                    if let Some(current) = renewed {
                        tracing::debug!("Credential already renewed, reusing it");
                        return Ok(current);
                    }

                    let generation = self.inner.started.fetch_add(1, Ordering::SeqCst) + 1;
                    let op = Inner::start(&self.inner, generation);
                    *state = RefreshState::Pending {
                        generation,
                        op: op.clone(),
                    };
                    op
                }
            }
        };

        op.await
    }

    /// Whether a refresh is currently pending
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.state.lock(), RefreshState::Pending { .. })
    }

    /// Number of refresh network calls started
    pub fn refresh_count(&self) -> u64 {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }
}

impl Inner {
    /// Spawn the refresh so it runs to completion even if every waiter goes away
    fn start(inner: &Arc<Self>, generation: u64) -> SharedRefresh {
        tracing::info!(generation, "Starting token refresh");

        let task = {
            let inner = inner.clone();
            tokio::spawn(async move { inner.run(generation).await })
        };

        let inner = inner.clone();
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    let failure = RefreshFailure::new(None, format!("Refresh task aborted: {}", e));
                    inner.fail(&failure);
                    inner.settle(generation);
                    Err(failure)
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn run(&self, generation: u64) -> RefreshResult {
        let result = self.refresher.refresh().await;

        match &result {
            Ok(token) => {
                self.store.set(token.clone());
                tracing::info!(
                    generation,
                    "Access token refreshed ({})",
                    mask_token(token)
                );
            }
            Err(failure) => {
                tracing::error!(generation, "Token refresh failed: {}", failure);
                self.fail(failure);
            }
        }

        // Store is settled before the slot frees and before waiters wake
        self.settle(generation);
        result
    }

    fn fail(&self, failure: &RefreshFailure) {
        self.store.clear();
        self.observer.session_terminated(failure);
    }

    fn settle(&self, generation: u64) {
        let mut state = self.state.lock();
        if let RefreshState::Pending { generation: current, .. } = &*state {
            if *current == generation {
                *state = RefreshState::Idle;
            }
        }
    }
}
