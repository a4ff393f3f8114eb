//! Keychain-backed secure storage
//!
//! A thin wrapper over the platform keychain for storing string secrets on
//! macOS (Keychain Access), Windows (Credential Manager), and Linux (Secret
//! Service API). The platform service encrypts entries at rest.
//!
//! ## Usage
//!
//! ```no_run
//! use tether_common::security::KeychainProvider;
//!
//! let keychain = KeychainProvider::new("tether.session");
//! keychain.set_secret("auth_tokens", "{...}")?;
//! let secret = keychain.get_secret("auth_tokens")?;
//! assert_eq!(secret, "{...}");
//! # Ok::<(), tether_common::security::KeychainError>(())
//! ```

use async_trait::async_trait;
use keyring::Entry;
use thiserror::Error;
use tracing::debug;

use crate::error::{ErrorClassification, ErrorSeverity};

/// Encrypted device-local key/value storage
///
/// Missing keys read as `None`; deleting a missing key succeeds.
#[async_trait]
pub trait SecureStore: Send + Sync {
    /// Read the value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<String>, KeychainError>;

    /// Store `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: &str) -> Result<(), KeychainError>;

    /// Remove `key` (idempotent)
    async fn delete(&self, key: &str) -> Result<(), KeychainError>;
}

/// Keychain provider scoped to one service name
#[derive(Debug, Clone)]
pub struct KeychainProvider {
    service_name: String,
}

impl KeychainProvider {
    /// Create a new keychain provider for a specific service
    ///
    /// ```
    /// use tether_common::security::KeychainProvider;
    ///
    /// let keychain = KeychainProvider::new("tether.session");
    /// assert_eq!(keychain.service_name(), "tether.session");
    /// ```
    pub fn new(service_name: impl Into<String>) -> Self {
        Self { service_name: service_name.into() }
    }

    /// Service name all entries are filed under
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Store a secret value in the platform keychain
    ///
    /// # Errors
    /// Returns `KeychainError::AccessFailed` if keychain access fails
    pub fn set_secret(&self, key: &str, value: &str) -> Result<(), KeychainError> {
        debug!(service = %self.service_name, key = %key, "Storing secret in keychain");

        let entry = self.create_entry(key)?;
        entry.set_password(value).map_err(|e| {
            KeychainError::AccessFailed(format!("Failed to store secret for {}: {}", key, e))
        })
    }

    /// Retrieve a secret value from the platform keychain
    ///
    /// # Errors
    /// Returns `KeychainError::NotFound` if secret doesn't exist
    /// Returns `KeychainError::AccessFailed` if keychain access fails
    pub fn get_secret(&self, key: &str) -> Result<String, KeychainError> {
        debug!(service = %self.service_name, key = %key, "Retrieving secret from keychain");

        let entry = self.create_entry(key)?;
        entry.get_password().map_err(|e| {
            if matches!(e, keyring::Error::NoEntry) {
                KeychainError::NotFound
            } else {
                KeychainError::AccessFailed(format!("Failed to retrieve secret for {}: {}", key, e))
            }
        })
    }

    /// Delete a secret from the platform keychain (idempotent)
    ///
    /// # Errors
    /// Returns `KeychainError::AccessFailed` if keychain access fails
    pub fn delete_secret(&self, key: &str) -> Result<(), KeychainError> {
        debug!(service = %self.service_name, key = %key, "Deleting secret from keychain");

        let entry = self.create_entry(key)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeychainError::AccessFailed(format!(
                "Failed to delete secret for {}: {}",
                key, e
            ))),
        }
    }

    fn create_entry(&self, account: &str) -> Result<Entry, KeychainError> {
        Entry::new(&self.service_name, account).map_err(|e| {
            KeychainError::AccessFailed(format!("Failed to create keychain entry: {}", e))
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, KeychainError>
    where
        T: Send + 'static,
        F: FnOnce(Self) -> Result<T, KeychainError> + Send + 'static,
    {
        let provider = self.clone();
        tokio::task::spawn_blocking(move || op(provider))
            .await
            .map_err(|e| KeychainError::AccessFailed(format!("Keychain task failed: {}", e)))?
    }
}

// Platform keychain calls block (D-Bus, Security.framework), so they run on
// the blocking pool.
#[async_trait]
impl SecureStore for KeychainProvider {
    async fn get(&self, key: &str) -> Result<Option<String>, KeychainError> {
        let key = key.to_string();
        self.blocking(move |kc| match kc.get_secret(&key) {
            Ok(value) => Ok(Some(value)),
            Err(KeychainError::NotFound) => Ok(None),
            Err(e) => Err(e),
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KeychainError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.blocking(move |kc| kc.set_secret(&key, &value)).await
    }

    async fn delete(&self, key: &str) -> Result<(), KeychainError> {
        let key = key.to_string();
        self.blocking(move |kc| kc.delete_secret(&key)).await
    }
}

/// Keychain error types
#[derive(Debug, Error)]
pub enum KeychainError {
    /// Keychain access failed (permission denied, not available, etc.)
    #[error("Keychain access failed: {0}")]
    AccessFailed(String),

    /// Entry not found in keychain
    #[error("Entry not found")]
    NotFound,

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ErrorClassification for KeychainError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::AccessFailed(_))
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::NotFound => ErrorSeverity::Info,
            Self::AccessFailed(_) | Self::Serialization(_) => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<std::time::Duration> {
        None
    }
}
