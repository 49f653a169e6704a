//! REST API client module for the SimplyCRM backend.
//!
//! This module provides the `ApiClient` every backend call goes through,
//! the pure retry policy it applies, and the authentication endpoints.
//!
//! The API uses Django REST framework token authentication
//! (`Authorization: Token <key>`) plus a CSRF token on unsafe methods.

pub mod auth;
pub mod client;
pub mod error;
pub mod policy;

pub use auth::{AuthApi, LoginRequest, RegistrationForm, UserProfile};
pub use client::{ApiClient, ApiResponse, RequestOptions};
pub use error::ApiError;
pub use policy::{AttemptState, Decision, Outcome, RetryPolicy};
