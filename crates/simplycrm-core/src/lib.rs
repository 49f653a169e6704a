//! Core library for the SimplyCRM client.
//!
//! [`ApiClient`] is the single surface for backend I/O. It is built from a
//! [`ClientConfig`], an injected [`SessionContext`] and a
//! [`NotificationBus`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use simplycrm_core::{ApiClient, ClientConfig, NotificationBus, SessionContext};
//!
//! # async fn run() -> Result<(), simplycrm_core::ApiError> {
//! let config = ClientConfig::from_env();
//! let session = Arc::new(SessionContext::in_memory());
//! let client = ApiClient::new(&config, session, NotificationBus::new())?;
//! let deals: serde_json::Value = client.get_json("/deals/").await?;
//! # let _ = deals;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod notify;

pub use api::{ApiClient, ApiError, ApiResponse, AuthApi, RequestOptions};
pub use auth::{FileTokenStore, KeyringTokenStore, SessionContext, TokenSlot};
pub use config::{ClientConfig, ConfigError};
pub use notify::{Notification, NotificationBus, NotificationKind};
pub use reqwest::Method;
