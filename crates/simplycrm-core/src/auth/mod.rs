//! Session and anti-forgery state shared by every request.
//!
//! This module provides:
//! - `SessionContext`: the injected per-process session (token + CSRF cache)
//! - `TokenSlot`: in-memory session token backed by a `TokenPersistence`
//! - `FileTokenStore` / `KeyringTokenStore`: durable token backends
//! - `CsrfCache`: CSRF token cache with a single in-flight refresh

pub mod credentials;
pub mod csrf;
pub mod session;

pub use credentials::KeyringTokenStore;
pub use csrf::{token_from_parts, CsrfCache, CSRF_HEADER};
pub use session::{
    FileTokenStore, MemoryTokenStore, SessionContext, TokenPersistence, TokenSlot,
    TOKEN_STORAGE_KEY,
};
