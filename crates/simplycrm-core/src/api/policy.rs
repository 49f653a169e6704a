//! Retry policy for a single logical request.
//!
//! Every outbound call carries an [`AttemptState`]. After each response the
//! client classifies it into an [`Outcome`] and asks [`RetryPolicy::decide`]
//! what happens next. Both steps are pure, so the retry rules can be tested
//! without a server.
//!
//! ```text
//! Init → Authenticated → (CsrfRejected → RetryOnce)
//!                      → (Throttled → Backoff{1..=max})
//!                      → Resolved | Failed
//! ```

use std::time::Duration;

use reqwest::{Method, StatusCode};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::ClientConfig;

/// Longest server-requested wait honored before resubmitting.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

/// Methods that never change server state and so never need a CSRF token.
pub fn is_safe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// Case-insensitive check for a CSRF cause in an error detail.
pub fn mentions_csrf(detail: &str) -> bool {
    detail.to_ascii_lowercase().contains("csrf")
}

/// Parse a `Retry-After` header given in whole seconds. Zero is ignored.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().filter(|secs| *secs > 0)
}

/// Content fingerprint of a request: SHA-256 over method, path, query and body.
pub fn fingerprint(
    method: &Method,
    path: &str,
    query: &[(String, String)],
    body: Option<&[u8]>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(path.as_bytes());
    for (i, (key, value)) in query.iter().enumerate() {
        hasher.update(if i == 0 { b"?" } else { b"&" });
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    hasher.update(b"\n");
    if let Some(body) = body {
        hasher.update(body);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Retry bookkeeping carried across resubmissions of one logical request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptState {
    pub retry_count: u32,
    pub csrf_retried: bool,
    /// Reserved for de-duplicating identical in-flight requests; not enforced.
    pub fingerprint: Option<String>,
}

impl AttemptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fingerprint(fingerprint: String) -> Self {
        Self {
            fingerprint: Some(fingerprint),
            ..Self::default()
        }
    }

    /// Record the retry a decision is about to perform.
    pub fn advance(&mut self, decision: &Decision) {
        match decision {
            Decision::RetryWithFreshCsrf => self.csrf_retried = true,
            Decision::Backoff { retry, .. } => self.retry_count = *retry,
            Decision::Resolve | Decision::ExpireSession | Decision::Fail => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// 401
    SessionExpired,
    /// 403 whose detail names CSRF
    CsrfRejected,
    /// 429, 423 or 503
    Throttled { retry_after: Option<u64> },
    Failure,
}

pub fn classify(status: StatusCode, detail: Option<&str>, retry_after: Option<u64>) -> Outcome {
    if status.is_success() {
        return Outcome::Success;
    }
    match status {
        StatusCode::UNAUTHORIZED => Outcome::SessionExpired,
        StatusCode::FORBIDDEN if detail.is_some_and(mentions_csrf) => Outcome::CsrfRejected,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::LOCKED | StatusCode::SERVICE_UNAVAILABLE => {
            Outcome::Throttled { retry_after }
        }
        _ => Outcome::Failure,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Resolve,
    /// Clear the session token and tell the user; never retried.
    ExpireSession,
    /// Invalidate the cached CSRF token, refresh it and resubmit once.
    RetryWithFreshCsrf,
    /// Sleep for `delay`, then resubmit as retry number `retry`.
    Backoff { retry: u32, delay: Duration },
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.max_retries, config.retry_base_delay)
    }

    pub fn decide(&self, attempt: &AttemptState, outcome: &Outcome) -> Decision {
        match *outcome {
            Outcome::Success => Decision::Resolve,
            Outcome::SessionExpired => Decision::ExpireSession,
            Outcome::CsrfRejected if !attempt.csrf_retried => Decision::RetryWithFreshCsrf,
            Outcome::Throttled { retry_after } if attempt.retry_count < self.max_retries => {
                let retry = attempt.retry_count + 1;
                Decision::Backoff {
                    retry,
                    delay: self.delay_for(retry, retry_after),
                }
            }
            Outcome::CsrfRejected | Outcome::Throttled { .. } | Outcome::Failure => Decision::Fail,
        }
    }

    /// Wait before retry number `retry` (1-based).
    ///
    /// A positive server `Retry-After` wins, capped at [`MAX_RETRY_AFTER`];
    /// otherwise `base * retry²`.
    pub fn delay_for(&self, retry: u32, retry_after: Option<u64>) -> Duration {
        if let Some(secs) = retry_after.filter(|secs| *secs > 0) {
            let requested = Duration::from_secs(secs);
            if requested > MAX_RETRY_AFTER {
                warn!(
                    retry_after_secs = secs,
                    cap_secs = MAX_RETRY_AFTER.as_secs(),
                    "Retry-After exceeds cap, waiting for the cap instead"
                );
                return MAX_RETRY_AFTER;
            }
            return requested;
        }
        self.base_delay.saturating_mul(retry.saturating_mul(retry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE_LIMITED: Outcome = Outcome::Throttled { retry_after: None };

    #[test]
    fn test_safe_methods() {
        assert!(is_safe_method(&Method::GET));
        assert!(is_safe_method(&Method::HEAD));
        assert!(is_safe_method(&Method::OPTIONS));
        assert!(is_safe_method(&Method::TRACE));
        assert!(!is_safe_method(&Method::POST));
        assert!(!is_safe_method(&Method::PUT));
        assert!(!is_safe_method(&Method::PATCH));
        assert!(!is_safe_method(&Method::DELETE));
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(StatusCode::OK, None, None), Outcome::Success);
        assert_eq!(classify(StatusCode::NO_CONTENT, None, None), Outcome::Success);
        assert_eq!(classify(StatusCode::UNAUTHORIZED, None, None), Outcome::SessionExpired);
        assert_eq!(
            classify(StatusCode::FORBIDDEN, Some("CSRF Failed: CSRF token incorrect."), None),
            Outcome::CsrfRejected
        );
        assert_eq!(
            classify(StatusCode::FORBIDDEN, Some("invalid csrf"), None),
            Outcome::CsrfRejected
        );
        assert_eq!(
            classify(StatusCode::FORBIDDEN, Some("You do not have permission."), None),
            Outcome::Failure
        );
        assert_eq!(classify(StatusCode::FORBIDDEN, None, None), Outcome::Failure);
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, None, Some(3)),
            Outcome::Throttled { retry_after: Some(3) }
        );
        assert_eq!(classify(StatusCode::LOCKED, None, None), RATE_LIMITED);
        assert_eq!(classify(StatusCode::SERVICE_UNAVAILABLE, None, None), RATE_LIMITED);
        assert_eq!(classify(StatusCode::INTERNAL_SERVER_ERROR, None, None), Outcome::Failure);
        assert_eq!(classify(StatusCode::BAD_REQUEST, None, None), Outcome::Failure);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("2"), Some(2));
        assert_eq!(parse_retry_after(" 30 "), Some(30));
        assert_eq!(parse_retry_after("0"), None);
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_quadratic_backoff_until_ceiling() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        let mut attempt = AttemptState::new();
        let mut delays = Vec::new();

        loop {
            match policy.decide(&attempt, &RATE_LIMITED) {
                decision @ Decision::Backoff { delay, .. } => {
                    delays.push(delay);
                    attempt.advance(&decision);
                }
                Decision::Fail => break,
                other => panic!("unexpected decision {:?}", other),
            }
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(2000),
                Duration::from_millis(4500),
            ]
        );
        assert_eq!(attempt.retry_count, 3);
    }

    #[test]
    fn test_retry_after_overrides_base_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        let decision = policy.decide(
            &AttemptState::new(),
            &Outcome::Throttled { retry_after: Some(2) },
        );
        assert_eq!(
            decision,
            Decision::Backoff {
                retry: 1,
                delay: Duration::from_millis(2000)
            }
        );

        let mut later = AttemptState::new();
        later.retry_count = 2;
        assert_eq!(policy.delay_for(3, Some(2)), Duration::from_secs(2));
        assert!(matches!(
            policy.decide(&later, &Outcome::Throttled { retry_after: Some(2) }),
            Decision::Backoff { retry: 3, .. }
        ));
    }

    #[test]
    fn test_retry_after_is_capped() {
        let policy = RetryPolicy::new(3, Duration::from_millis(500));
        assert_eq!(policy.delay_for(1, Some(86_400)), MAX_RETRY_AFTER);
        assert_eq!(policy.delay_for(1, Some(120)), Duration::from_secs(120));
    }

    #[test]
    fn test_zero_retries_fails_immediately() {
        let policy = RetryPolicy::new(0, Duration::from_millis(500));
        assert_eq!(policy.decide(&AttemptState::new(), &RATE_LIMITED), Decision::Fail);
    }

    #[test]
    fn test_csrf_retry_happens_once() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        let mut attempt = AttemptState::new();

        let first = policy.decide(&attempt, &Outcome::CsrfRejected);
        assert_eq!(first, Decision::RetryWithFreshCsrf);
        attempt.advance(&first);
        assert!(attempt.csrf_retried);

        assert_eq!(policy.decide(&attempt, &Outcome::CsrfRejected), Decision::Fail);
    }

    #[test]
    fn test_retry_budgets_are_independent() {
        let policy = RetryPolicy::new(1, Duration::from_millis(10));
        let mut attempt = AttemptState::new();

        let csrf = policy.decide(&attempt, &Outcome::CsrfRejected);
        attempt.advance(&csrf);

        // The CSRF retry did not consume the transient budget.
        let backoff = policy.decide(&attempt, &RATE_LIMITED);
        assert!(matches!(backoff, Decision::Backoff { retry: 1, .. }));
        attempt.advance(&backoff);

        assert_eq!(policy.decide(&attempt, &RATE_LIMITED), Decision::Fail);
        assert_eq!(policy.decide(&attempt, &Outcome::CsrfRejected), Decision::Fail);
    }

    #[test]
    fn test_session_expiry_is_never_retried() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        assert_eq!(
            policy.decide(&AttemptState::new(), &Outcome::SessionExpired),
            Decision::ExpireSession
        );
    }

    #[test]
    fn test_other_failures_pass_through() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10));
        assert_eq!(policy.decide(&AttemptState::new(), &Outcome::Failure), Decision::Fail);
        assert_eq!(policy.decide(&AttemptState::new(), &Outcome::Success), Decision::Resolve);
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let query = vec![("page".to_string(), "2".to_string())];
        let a = fingerprint(&Method::POST, "/deals/", &query, Some(b"{\"a\":1}"));
        let b = fingerprint(&Method::POST, "/deals/", &query, Some(b"{\"a\":1}"));
        let c = fingerprint(&Method::POST, "/deals/", &query, Some(b"{\"a\":2}"));
        let d = fingerprint(&Method::PUT, "/deals/", &query, Some(b"{\"a\":1}"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }
}
