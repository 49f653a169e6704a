//! CSRF token cache with a single in-flight refresh.
//!
//! The cache holds at most one token. When it is empty, the first caller
//! publishes a shared refresh future and every caller that arrives before it
//! resolves awaits that same future. The lock is only held to inspect or
//! publish state, never across an await.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};
use reqwest::header::HeaderMap;
use tracing::debug;

use crate::api::ApiError;

pub const CSRF_HEADER: &str = "X-CSRFToken";

/// Body fields a token may be returned in, checked in order.
const CSRF_BODY_FIELDS: [&str; 2] = ["csrfToken", "csrf_token"];

pub type CsrfResult = Result<String, Arc<ApiError>>;

type PendingRefresh = Shared<BoxFuture<'static, CsrfResult>>;

#[derive(Default)]
struct CsrfState {
    token: Option<String>,
    pending: Option<PendingRefresh>,
}

#[derive(Default)]
pub struct CsrfCache {
    state: Mutex<CsrfState>,
}

impl CsrfCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CsrfState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> Option<String> {
        self.lock().token.clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.lock().pending.is_some()
    }

    /// Replace the cached token unconditionally.
    pub fn store(&self, token: impl Into<String>) {
        self.lock().token = Some(token.into());
    }

    /// Drop the cached token if it is still `stale`.
    ///
    /// Returns false when another caller already replaced it, in which case
    /// the newer token is kept.
    pub fn invalidate(&self, stale: &str) -> bool {
        let mut state = self.lock();
        if state.token.as_deref() == Some(stale) {
            state.token = None;
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        self.lock().token = None;
    }

    /// Return the cached token, or join (starting if needed) the one refresh.
    ///
    /// `refresh` is only invoked when no token is cached and no refresh is
    /// pending. A failed refresh is reported to every waiter and leaves the
    /// cache empty so the next caller starts over. A token stored while the
    /// refresh was running is newer and is kept.
    pub async fn token_or_refresh<F, Fut>(&self, refresh: F) -> CsrfResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, ApiError>> + Send + 'static,
    {
        let pending = {
            let mut state = self.lock();
            if let Some(token) = &state.token {
                return Ok(token.clone());
            }
            if let Some(pending) = state.pending.clone() {
                debug!("Joining in-flight CSRF refresh");
                pending
            } else {
                let pending = refresh().map_err(Arc::new).boxed().shared();
                state.pending = Some(pending.clone());
                pending
            }
        };

        let result = pending.clone().await;

        let mut state = self.lock();
        if state
            .pending
            .as_ref()
            .is_some_and(|current| current.ptr_eq(&pending))
        {
            state.pending = None;
            if let Ok(token) = &result {
                state.token.get_or_insert_with(|| token.clone());
            }
        }
        result
    }
}

/// Extract a CSRF token from a response header or JSON body field.
pub fn token_from_parts(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    let from_header = headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(token) = from_header {
        return Some(token.to_string());
    }

    if body.iter().find(|b| !b.is_ascii_whitespace()) != Some(&b'{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    CSRF_BODY_FIELDS
        .iter()
        .filter_map(|field| value.get(*field).and_then(|v| v.as_str()))
        .find(|token| !token.is_empty())
        .map(str::to_string)
}
