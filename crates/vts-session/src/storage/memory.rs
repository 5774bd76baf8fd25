//! In-memory token store.

use std::sync::RwLock;

use vts_core::traits::{StorageError, TokenStore};

/// In-memory token store.
///
/// Useful for tests and short-lived tools.
/// The token is lost on restart, so the host asks the user again.
pub struct MemoryTokenStore {
    token: RwLock<Option<String>>,
}

impl MemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            token: RwLock::new(None),
        }
    }

    /// Create a store already holding `token`.
    #[must_use]
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }
}

impl Default for MemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .token
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .clone())
    }

    fn save(&self, token: &str) -> Result<(), StorageError> {
        *self
            .token
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))? = Some(token.to_string());
        Ok(())
    }

    fn delete(&self) -> Result<(), StorageError> {
        self.token
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .take();
        Ok(())
    }
}
