//! Authentication endpoints (`/auth/*`).
//!
//! Thin wrappers over [`ApiClient`] that also keep the session token in sync:
//! successful login, registration and Google sign-in store the returned
//! token; logout clears it even when the revoke call fails.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::client::{ApiClient, RequestOptions};
use super::ApiError;

const TOKEN_PATH: &str = "/auth/token/";
const REVOKE_PATH: &str = "/auth/token/revoke/";
const REGISTER_PATH: &str = "/auth/register/";
const GOOGLE_PATH: &str = "/auth/google/";
const PROFILE_PATH: &str = "/auth/profile/";

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captcha_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrationForm {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub first_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoogleLoginRequest {
    /// Google ID token (the `credential` from Google Identity Services).
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrganizationSummary {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeatureFlag {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub organization: Option<OrganizationSummary>,
    #[serde(default)]
    pub feature_flags: Vec<FeatureFlag>,
}

impl UserProfile {
    pub fn is_feature_enabled(&self, code: &str) -> bool {
        self.feature_flags
            .iter()
            .any(|flag| flag.code == code && flag.enabled)
    }

    pub fn display_name(&self) -> String {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(first), Some(last)) if !first.is_empty() && !last.is_empty() => {
                format!("{} {}", first, last)
            }
            (Some(first), _) if !first.is_empty() => first.to_string(),
            _ => self.username.clone(),
        }
    }
}

/// Result of registration or Google sign-in.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceSession {
    pub token: String,
    pub user: UserSummary,
    pub organization: Option<OrganizationSummary>,
    #[serde(default)]
    pub is_new_user: bool,
}

/// Authentication calls bound to one client (and therefore one session).
#[derive(Clone)]
pub struct AuthApi {
    client: ApiClient,
}

impl AuthApi {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Exchange credentials for a session token and store it.
    pub async fn login(&self, request: &LoginRequest) -> Result<String, ApiError> {
        let response: TokenResponse = self.client.post_json(TOKEN_PATH, request).await?;
        self.store_token(&response.token);
        info!(username = %request.username, "Logged in");
        Ok(response.token)
    }

    pub async fn register(&self, form: &RegistrationForm) -> Result<WorkspaceSession, ApiError> {
        let session: WorkspaceSession = self.client.post_json(REGISTER_PATH, form).await?;
        self.store_token(&session.token);
        info!(email = %form.email, new_user = session.is_new_user, "Registered");
        Ok(session)
    }

    pub async fn login_with_google(
        &self,
        request: &GoogleLoginRequest,
    ) -> Result<WorkspaceSession, ApiError> {
        let session: WorkspaceSession = self.client.post_json(GOOGLE_PATH, request).await?;
        self.store_token(&session.token);
        info!(user = %session.user.username, new_user = session.is_new_user, "Logged in with Google");
        Ok(session)
    }

    /// Revoke the token server-side; the local token is cleared regardless.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = self
            .client
            .request(Method::POST, REVOKE_PATH, RequestOptions::new())
            .await;
        if let Err(e) = self.client.session().tokens().clear() {
            warn!(error = %e, "Failed to clear persisted session token");
        }
        info!("Logged out");
        result.map(|_| ())
    }

    pub async fn profile(&self) -> Result<UserProfile, ApiError> {
        self.client.get_json(PROFILE_PATH).await
    }

    fn store_token(&self, token: &str) {
        if let Err(e) = self.client.session().tokens().set(token) {
            warn!(error = %e, "Failed to persist session token");
        }
    }
}
