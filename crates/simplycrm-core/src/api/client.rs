//! Resilient client for the SimplyCRM REST API.
//!
//! Every backend call goes through [`ApiClient::request`]. It attaches the
//! session token, obtains a CSRF token for state-changing methods, and
//! applies the retry rules in [`super::policy`]: one resubmission after a
//! CSRF rejection, bounded backoff for throttling, and session expiry on 401.
//! Callers only ever see the final outcome.

use std::sync::Arc;

use reqwest::header::{self, HeaderMap};
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::auth::{token_from_parts, SessionContext, CSRF_HEADER};
use crate::config::ClientConfig;
use crate::notify::{Notification, NotificationBus};

use super::policy::{self, AttemptState, Decision, Outcome, RetryPolicy};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Scheme for the `Authorization` header (Django REST framework token auth).
const AUTH_SCHEME: &str = "Token";

const REQUESTED_WITH_HEADER: &str = "X-Requested-With";
const REQUESTED_WITH_VALUE: &str = "XMLHttpRequest";

const RETRY_AFTER_HEADER: &str = "Retry-After";

/// Query parameters and JSON body of a request.
///
/// The body is serialized once so every resubmission sends identical bytes.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        self.body = Some(serde_json::to_vec(body)?);
        Ok(self)
    }
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ApiResponse {
    async fn read(response: reqwest::Response) -> Result<Self, ApiError> {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        Ok(Self {
            status,
            headers,
            body,
        })
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Server-supplied wait in seconds, if any.
    pub fn retry_after(&self) -> Option<u64> {
        self.headers
            .get(RETRY_AFTER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(policy::parse_retry_after)
    }

    /// Classify for the retry policy. A 403 only counts as a CSRF rejection
    /// when the request actually carried a CSRF token.
    fn outcome(&self, sent_csrf: bool) -> Outcome {
        let detail = if sent_csrf && self.status == StatusCode::FORBIDDEN {
            Some(ApiError::detail_from_body(&self.body))
        } else {
            None
        };
        policy::classify(self.status, detail.as_deref(), self.retry_after())
    }

    fn into_error(self) -> ApiError {
        ApiError::from_response(self.status, self.retry_after(), &self.body)
    }
}

/// API client for SimplyCRM.
/// Clone is cheap - the reqwest pool and the session are shared.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    csrf_path: String,
    policy: RetryPolicy,
    session: Arc<SessionContext>,
    notifications: NotificationBus,
}

impl ApiClient {
    pub fn new(
        config: &ClientConfig,
        session: Arc<SessionContext>,
        notifications: NotificationBus,
    ) -> Result<Self, ApiError> {
        let base_url = config.resolve_base_url()?;
        // The cookie jar keeps Django's `csrftoken` cookie paired with the header.
        let http = Client::builder()
            .cookie_store(true)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
            csrf_path: config.csrf_path.clone(),
            policy: RetryPolicy::from_config(config),
            session,
            notifications,
        })
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    pub fn notifications(&self) -> &NotificationBus {
        &self.notifications
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send a request, handling auth, CSRF and transient failures.
    ///
    /// Resolves with the first successful response. Fails with the error of
    /// the last response once no retry rule applies, or with
    /// `ApiError::Network` when no response arrived at all (including
    /// client-side timeouts, which are not retried).
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.url_for(path);
        let mut attempt = AttemptState::with_fingerprint(policy::fingerprint(
            &method,
            path,
            &options.query,
            options.body.as_deref(),
        ));
        debug!(
            method = %method,
            url = %url,
            fingerprint = attempt.fingerprint.as_deref().unwrap_or_default(),
            "Dispatching request"
        );

        loop {
            let csrf_token = if policy::is_safe_method(&method) {
                None
            } else {
                Some(self.csrf_token().await.map_err(|e| match e {
                    ApiError::CsrfUnavailable(cause) if matches!(*cause, ApiError::Unauthorized) => {
                        ApiError::Unauthorized
                    }
                    other => other,
                })?)
            };

            let response = self
                .send_once(&method, &url, &options, csrf_token.as_deref())
                .await?;
            let outcome = response.outcome(csrf_token.is_some());
            if outcome == Outcome::Success {
                self.absorb_csrf_token(&response);
            }

            let decision = self.policy.decide(&attempt, &outcome);
            match decision {
                Decision::Resolve => return Ok(response),
                Decision::ExpireSession => {
                    self.expire_session();
                    return Err(ApiError::Unauthorized);
                }
                Decision::RetryWithFreshCsrf => {
                    warn!(url = %url, "CSRF token rejected, refreshing and resubmitting once");
                    if let Some(stale) = csrf_token.as_deref() {
                        self.session.csrf().invalidate(stale);
                    }
                }
                Decision::Backoff { retry, delay } => {
                    let retry_after = response.retry_after();
                    self.notifications.publish(Notification::throttled(retry_after));
                    warn!(
                        url = %url,
                        status = response.status().as_u16(),
                        retry,
                        backoff_ms = delay.as_millis() as u64,
                        "Throttled, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Decision::Fail => {
                    if let Outcome::Throttled { retry_after } = outcome {
                        self.notifications.publish(Notification::throttled(retry_after));
                        warn!(url = %url, retries = attempt.retry_count, "Throttled, retry limit reached");
                    }
                    return Err(response.into_error());
                }
            }
            attempt.advance(&decision);
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        options: &RequestOptions,
        csrf_token: Option<&str>,
    ) -> Result<ApiResponse, ApiError> {
        let mut builder = self.http.request(method.clone(), url);
        if !options.query.is_empty() {
            builder = builder.query(&options.query);
        }
        if let Some(token) = self.session.tokens().get() {
            builder = builder.header(header::AUTHORIZATION, format!("{} {}", AUTH_SCHEME, token));
        }
        if let Some(csrf) = csrf_token {
            builder = builder
                .header(CSRF_HEADER, csrf)
                .header(REQUESTED_WITH_HEADER, REQUESTED_WITH_VALUE);
        }
        if let Some(body) = &options.body {
            builder = builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let response = builder.send().await.map_err(|e| {
            warn!(url = url, timeout = e.is_timeout(), error = %e, "Request failed without a response");
            ApiError::from(e)
        })?;
        ApiResponse::read(response).await
    }

    /// Cached CSRF token, or the result of the single shared refresh.
    ///
    /// A 401 from the token endpoint expires the session that was sent with
    /// it, so the next refresh goes out anonymously.
    pub async fn csrf_token(&self) -> Result<String, ApiError> {
        let http = self.http.clone();
        let url = self.url_for(&self.csrf_path);
        let session_token = self.session.tokens().get();
        let sent_token = session_token.clone();

        let result = self
            .session
            .csrf()
            .token_or_refresh(move || fetch_csrf_token(http, url, session_token))
            .await;

        result.map_err(|e| {
            if let (ApiError::Unauthorized, Some(stale)) = (&*e, sent_token.as_deref()) {
                self.expire_stale_session(stale);
            }
            ApiError::CsrfUnavailable(e)
        })
    }

    fn absorb_csrf_token(&self, response: &ApiResponse) {
        if let Some(token) = token_from_parts(response.headers(), response.body()) {
            if self.session.csrf().current().as_deref() != Some(token.as_str()) {
                debug!("Response carried a fresh CSRF token");
            }
            self.session.csrf().store(token);
        }
    }

    fn expire_session(&self) {
        warn!("Session expired, clearing token");
        if let Err(e) = self.session.tokens().clear() {
            warn!(error = %e, "Failed to clear persisted session token");
        }
        self.notifications.publish(Notification::session_expired());
    }

    /// Expire the session only if it still holds `stale`; callers sharing
    /// one failed refresh notify once between them.
    fn expire_stale_session(&self, stale: &str) {
        match self.session.tokens().clear_if(stale) {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => warn!(error = %e, "Failed to clear persisted session token"),
        }
        warn!("Session expired while refreshing CSRF token, clearing token");
        self.notifications.publish(Notification::session_expired());
    }

    // ===== Convenience Methods =====

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.request(Method::GET, path, RequestOptions::new()).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.request(Method::DELETE, path, RequestOptions::new()).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.get(path).await?.json()
    }

    pub async fn post_json<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(Method::POST, path, body).await
    }

    pub async fn put_json<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(Method::PUT, path, body).await
    }

    pub async fn patch_json<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send_json(Method::PATCH, path, body).await
    }

    async fn send_json<T, B>(&self, method: Method, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let options = RequestOptions::new().json(body)?;
        self.request(method, path, options).await?.json()
    }
}

/// GET the token endpoint; never carries a CSRF header itself.
async fn fetch_csrf_token(
    http: Client,
    url: String,
    session_token: Option<String>,
) -> Result<String, ApiError> {
    debug!(url = %url, "Refreshing CSRF token");

    let mut builder = http
        .get(&url)
        .header(REQUESTED_WITH_HEADER, REQUESTED_WITH_VALUE);
    if let Some(token) = session_token {
        builder = builder.header(header::AUTHORIZATION, format!("{} {}", AUTH_SCHEME, token));
    }

    let response = ApiResponse::read(builder.send().await?).await?;
    if !response.status().is_success() {
        return Err(response.into_error());
    }
    token_from_parts(response.headers(), response.body())
        .ok_or_else(|| ApiError::InvalidResponse("CSRF endpoint returned no token".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ApiClient {
        ApiClient::new(
            &ClientConfig::new(base),
            Arc::new(SessionContext::in_memory()),
            NotificationBus::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_url_for_joins_slashes() {
        let api = client("https://crm.example.com/api/");
        assert_eq!(api.url_for("/deals/"), "https://crm.example.com/api/deals/");
        assert_eq!(api.url_for("deals/"), "https://crm.example.com/api/deals/");
    }

    #[test]
    fn test_invalid_base_url_is_config_error() {
        let result = ApiClient::new(
            &ClientConfig::new("not a url"),
            Arc::new(SessionContext::in_memory()),
            NotificationBus::new(),
        );
        assert!(matches!(result, Err(ApiError::Config(_))));
    }

    #[test]
    fn test_request_options_serialize_body_once() {
        let options = RequestOptions::new()
            .query("page", "2")
            .json(&serde_json::json!({"name": "Acme"}))
            .unwrap();
        assert_eq!(options.query, vec![("page".to_string(), "2".to_string())]);
        assert_eq!(options.body.as_deref(), Some(br#"{"name":"Acme"}"#.as_slice()));
    }

    #[test]
    fn test_response_retry_after_and_outcome() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER_HEADER, header::HeaderValue::from_static("2"));
        let response = ApiResponse {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers,
            body: Vec::new(),
        };
        assert_eq!(response.retry_after(), Some(2));
        assert_eq!(response.outcome(false), Outcome::Throttled { retry_after: Some(2) });

        let forbidden = ApiResponse {
            status: StatusCode::FORBIDDEN,
            headers: HeaderMap::new(),
            body: br#"{"detail":"CSRF Failed: CSRF token missing."}"#.to_vec(),
        };
        assert_eq!(forbidden.outcome(true), Outcome::CsrfRejected);
        // Without a CSRF token on the request there is nothing to refresh
        assert_eq!(forbidden.outcome(false), Outcome::Failure);
        assert!(matches!(forbidden.into_error(), ApiError::CsrfRejected(_)));
    }
}
