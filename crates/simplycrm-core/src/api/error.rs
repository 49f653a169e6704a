use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized - session expired or token invalid")]
    Unauthorized,

    #[error("CSRF token rejected: {0}")]
    CsrfRejected(String),

    #[error("Rate limited (status {status}) - please wait before retrying")]
    Throttled {
        status: u16,
        retry_after: Option<u64>,
        detail: String,
    },

    #[error("Request failed with status {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("CSRF token unavailable: {0}")]
    CsrfUnavailable(#[source] Arc<ApiError>),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Human-readable detail for a failed response.
    ///
    /// Django REST framework reports errors as `{"detail": "..."}`; anything
    /// else is returned as (truncated) text.
    pub fn detail_from_body(body: &[u8]) -> String {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
            if let Some(detail) = value.get("detail").and_then(|d| d.as_str()) {
                return Self::truncate_body(detail);
            }
        }
        Self::truncate_body(&String::from_utf8_lossy(body))
    }

    pub fn from_response(status: StatusCode, retry_after: Option<u64>, body: &[u8]) -> Self {
        let detail = Self::detail_from_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 if super::policy::mentions_csrf(&detail) => ApiError::CsrfRejected(detail),
            423 | 429 | 503 => ApiError::Throttled {
                status: status.as_u16(),
                retry_after,
                detail,
            },
            _ => ApiError::Status {
                status: status.as_u16(),
                detail,
            },
        }
    }

    /// HTTP status behind this error, when there was a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized => Some(401),
            ApiError::CsrfRejected(_) => Some(403),
            ApiError::Throttled { status, .. } | ApiError::Status { status, .. } => Some(*status),
            ApiError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Network(e) if e.is_timeout())
    }
}
