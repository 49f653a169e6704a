use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::CsrfCache;

/// Application name used for the cache directory path
const APP_NAME: &str = "simplycrm";

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Fixed key the session token is stored under, in every backend.
pub const TOKEN_STORAGE_KEY: &str = "simplycrm.accessToken";

/// Durable slot for the session token.
pub trait TokenPersistence: Send + Sync {
    fn load(&self) -> Result<Option<String>>;
    fn save(&self, token: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedToken {
    #[serde(rename = "simplycrm.accessToken")]
    pub token: String,
    pub saved_at: DateTime<Utc>,
}

/// Token persisted as JSON in the cache directory.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(SESSION_FILE),
        }
    }

    /// Store under `<cache dir>/simplycrm/session.json`.
    pub fn default_location() -> Result<Self> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(Self::new(cache_dir.join(APP_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenPersistence for FileTokenStore {
    fn load(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read session file")?;
        let persisted: PersistedToken = serde_json::from_str(&contents)
            .context("Failed to parse session file")?;
        debug!(saved_at = %persisted.saved_at, "Loaded persisted session token");
        Ok(Some(persisted.token))
    }

    fn save(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let persisted = PersistedToken {
            token: token.to_string(),
            saved_at: Utc::now(),
        };
        let contents = serde_json::to_string_pretty(&persisted)?;
        std::fs::write(&self.path, contents).context("Failed to write session file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}

/// Process-local store; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    value: Mutex<Option<String>>,
}

impl TokenPersistence for MemoryTokenStore {
    fn load(&self) -> Result<Option<String>> {
        Ok(self.value.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, token: &str) -> Result<()> {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// In-memory session token mirrored to a persistence backend.
///
/// The in-memory value is read before every request; the backend only
/// matters across restarts. Writes update memory first, so a failing
/// backend never leaves a stale token in use.
pub struct TokenSlot {
    current: RwLock<Option<String>>,
    persistence: Box<dyn TokenPersistence>,
}

impl TokenSlot {
    pub fn new(persistence: impl TokenPersistence + 'static) -> Self {
        Self {
            current: RwLock::new(None),
            persistence: Box::new(persistence),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryTokenStore::default())
    }

    /// Load a persisted token into memory. Returns the token if one was found.
    pub fn bootstrap(&self) -> Result<Option<String>> {
        let token = self.persistence.load()?;
        if token.is_some() {
            *self.current.write().unwrap_or_else(PoisonError::into_inner) = token.clone();
        }
        Ok(token)
    }

    pub fn get(&self) -> Option<String> {
        self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.current.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn set(&self, token: impl Into<String>) -> Result<()> {
        let token = token.into();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        self.persistence.save(&token)
    }

    pub fn clear(&self) -> Result<()> {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.persistence.clear()
    }

    /// Clear the token only if it is still `expected`.
    ///
    /// Returns `Ok(false)` when the slot already holds something else (or
    /// nothing). An `Err` means memory was cleared but the backend was not.
    pub fn clear_if(&self, expected: &str) -> Result<bool> {
        {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            if current.as_deref() != Some(expected) {
                return Ok(false);
            }
            *current = None;
        }
        self.persistence.clear()?;
        Ok(true)
    }
}

/// Per-process session state injected into the API client.
pub struct SessionContext {
    tokens: TokenSlot,
    csrf: CsrfCache,
}

impl SessionContext {
    pub fn new(tokens: TokenSlot) -> Self {
        Self {
            tokens,
            csrf: CsrfCache::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(TokenSlot::in_memory())
    }

    pub fn tokens(&self) -> &TokenSlot {
        &self.tokens
    }

    pub fn csrf(&self) -> &CsrfCache {
        &self.csrf
    }
}
