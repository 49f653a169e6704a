//! Client configuration.
//!
//! Settings come from `SIMPLYCRM_*` environment variables (the CLI loads a
//! `.env` file first). Values that fail to parse fall back to the defaults
//! with a warning rather than aborting startup.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;
use url::Url;

// ============================================================================
// Constants
// ============================================================================

pub const ENV_API_BASE_URL: &str = "SIMPLYCRM_API_BASE_URL";
pub const ENV_APP_ORIGIN: &str = "SIMPLYCRM_APP_ORIGIN";
pub const ENV_API_ALLOW_CROSS_ORIGIN: &str = "SIMPLYCRM_API_ALLOW_CROSS_ORIGIN";
pub const ENV_API_MAX_RETRIES: &str = "SIMPLYCRM_API_MAX_RETRIES";
pub const ENV_API_RETRY_BASE_DELAY_MS: &str = "SIMPLYCRM_API_RETRY_BASE_DELAY_MS";
pub const ENV_API_TIMEOUT_MS: &str = "SIMPLYCRM_API_TIMEOUT_MS";
pub const ENV_API_CSRF_PATH: &str = "SIMPLYCRM_API_CSRF_PATH";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";

/// Transient-failure retries per request.
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Backoff multiplier; the n-th retry waits `base * n²`.
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 800;

/// Overall timeout for a single HTTP exchange.
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

const DEFAULT_CSRF_PATH: &str = "/auth/csrf/";

/// Path used on the application origin when a cross-origin base URL is refused.
const SAME_ORIGIN_API_PATH: &str = "/api";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid API base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("Invalid application origin {url:?}: {reason}")]
    InvalidAppOrigin { url: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub app_origin: Option<String>,
    pub allow_cross_origin: bool,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub timeout: Duration,
    pub csrf_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            app_origin: None,
            allow_cross_origin: false,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            csrf_path: DEFAULT_CSRF_PATH.to_string(),
        }
    }
}

impl ClientConfig {
    /// Configuration with defaults for everything except the base URL.
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_base_url = value(ENV_API_BASE_URL).unwrap_or_else(|| {
            warn!(var = ENV_API_BASE_URL, fallback = DEFAULT_API_BASE_URL, "Environment variable is not defined");
            defaults.api_base_url.clone()
        });

        Self {
            api_base_url,
            app_origin: value(ENV_APP_ORIGIN),
            allow_cross_origin: value(ENV_API_ALLOW_CROSS_ORIGIN)
                .map(|raw| parse_flag(ENV_API_ALLOW_CROSS_ORIGIN, &raw))
                .unwrap_or(defaults.allow_cross_origin),
            max_retries: parse_number(ENV_API_MAX_RETRIES, value(ENV_API_MAX_RETRIES), DEFAULT_MAX_RETRIES),
            retry_base_delay: Duration::from_millis(parse_number(
                ENV_API_RETRY_BASE_DELAY_MS,
                value(ENV_API_RETRY_BASE_DELAY_MS),
                DEFAULT_RETRY_BASE_DELAY_MS,
            )),
            timeout: Duration::from_millis(parse_number(
                ENV_API_TIMEOUT_MS,
                value(ENV_API_TIMEOUT_MS),
                DEFAULT_TIMEOUT_MS,
            )),
            csrf_path: value(ENV_API_CSRF_PATH).unwrap_or(defaults.csrf_path),
        }
    }

    pub fn with_app_origin(mut self, origin: impl Into<String>) -> Self {
        self.app_origin = Some(origin.into());
        self
    }

    pub fn with_allow_cross_origin(mut self, allow: bool) -> Self {
        self.allow_cross_origin = allow;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_csrf_path(mut self, path: impl Into<String>) -> Self {
        self.csrf_path = path.into();
        self
    }

    /// Resolve the URL every request is issued against.
    ///
    /// A relative base URL is joined onto the application origin. An absolute
    /// base URL on a different origin than the application is replaced by
    /// `{app_origin}/api` unless cross-origin access is explicitly allowed.
    pub fn resolve_base_url(&self) -> Result<Url, ConfigError> {
        let app_origin = self
            .app_origin
            .as_deref()
            .map(|raw| {
                Url::parse(raw).map_err(|e| ConfigError::InvalidAppOrigin {
                    url: raw.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let base = match (Url::parse(&self.api_base_url), &app_origin) {
            (Ok(url), _) => url,
            (Err(url::ParseError::RelativeUrlWithoutBase), Some(origin)) => origin
                .join(&self.api_base_url)
                .map_err(|e| self.invalid_base(e))?,
            (Err(e), _) => return Err(self.invalid_base(e)),
        };

        let Some(origin) = app_origin else {
            return Ok(base);
        };

        if self.allow_cross_origin || base.origin() == origin.origin() {
            return Ok(base);
        }

        warn!(
            configured = %base,
            app_origin = %origin,
            "API base URL is cross-origin; falling back to same-origin API path"
        );
        origin
            .join(SAME_ORIGIN_API_PATH)
            .map_err(|e| self.invalid_base(e))
    }

    fn invalid_base(&self, error: url::ParseError) -> ConfigError {
        ConfigError::InvalidBaseUrl {
            url: self.api_base_url.clone(),
            reason: error.to_string(),
        }
    }
}

fn parse_number<T>(key: &str, raw: Option<String>, fallback: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match raw {
        None => fallback,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(var = key, value = %raw, fallback = %fallback, "Ignoring unparsable number");
            fallback
        }),
    }
}

fn parse_flag(key: &str, raw: &str) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(var = key, value = %raw, "Ignoring unrecognized flag value");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = ClientConfig::from_lookup(lookup(&[]));
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_base_delay, Duration::from_millis(800));
        assert_eq!(config.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_from_lookup_reads_values() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ENV_API_BASE_URL, "https://crm.example.com/api"),
            (ENV_API_ALLOW_CROSS_ORIGIN, "TRUE"),
            (ENV_API_MAX_RETRIES, "5"),
            (ENV_API_RETRY_BASE_DELAY_MS, "250"),
            (ENV_API_TIMEOUT_MS, "3000"),
        ]));
        assert_eq!(config.api_base_url, "https://crm.example.com/api");
        assert!(config.allow_cross_origin);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_base_delay, Duration::from_millis(250));
        assert_eq!(config.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_unparsable_numbers_fall_back() {
        let config = ClientConfig::from_lookup(lookup(&[
            (ENV_API_MAX_RETRIES, "many"),
            (ENV_API_RETRY_BASE_DELAY_MS, "-1"),
        ]));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_base_delay, Duration::from_millis(800));
    }

    #[test]
    fn test_resolve_without_app_origin() {
        let config = ClientConfig::new("https://crm.example.com/api");
        let url = config.resolve_base_url().unwrap();
        assert_eq!(url.as_str(), "https://crm.example.com/api");
    }

    #[test]
    fn test_resolve_relative_against_app_origin() {
        let config = ClientConfig::new("/api").with_app_origin("https://app.example.com");
        let url = config.resolve_base_url().unwrap();
        assert_eq!(url.as_str(), "https://app.example.com/api");
    }

    #[test]
    fn test_relative_without_app_origin_is_error() {
        let config = ClientConfig::new("/api");
        assert!(matches!(
            config.resolve_base_url(),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn test_cross_origin_falls_back() {
        let config = ClientConfig::new("https://other.example.com/api")
            .with_app_origin("https://app.example.com");
        let url = config.resolve_base_url().unwrap();
        assert_eq!(url.as_str(), "https://app.example.com/api");
    }

    #[test]
    fn test_cross_origin_allowed() {
        let config = ClientConfig::new("https://other.example.com/api")
            .with_app_origin("https://app.example.com")
            .with_allow_cross_origin(true);
        let url = config.resolve_base_url().unwrap();
        assert_eq!(url.as_str(), "https://other.example.com/api");
    }

    #[test]
    fn test_same_origin_kept() {
        let config = ClientConfig::new("https://app.example.com/v2/api")
            .with_app_origin("https://app.example.com");
        let url = config.resolve_base_url().unwrap();
        assert_eq!(url.as_str(), "https://app.example.com/v2/api");
    }

    #[test]
    fn test_port_mismatch_is_cross_origin() {
        let config = ClientConfig::new("http://localhost:8000/api")
            .with_app_origin("http://localhost:5173");
        let url = config.resolve_base_url().unwrap();
        assert_eq!(url.as_str(), "http://localhost:5173/api");
    }
}
