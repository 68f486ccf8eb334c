//! Secure credential storage using the system keyring

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use keyring::Entry;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyringError {
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("Credential not found")]
    NotFound,
    #[error("Keyring backend unavailable: {0}")]
    Backend(String),
}

/// Raw secret store addressed by (service, account)
pub trait SecretBackend: Send + Sync {
    fn get(&self, service: &str, account: &str) -> Result<Vec<u8>, KeyringError>;

    fn add(&self, service: &str, account: &str, secret: &[u8]) -> Result<(), KeyringError>;

    /// Removing a missing entry is not an error
    fn delete(&self, service: &str, account: &str) -> Result<(), KeyringError>;
}

/// The platform keyring (Keychain, Credential Manager, kernel keyutils)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemKeyring;

impl SecretBackend for SystemKeyring {
    fn get(&self, service: &str, account: &str) -> Result<Vec<u8>, KeyringError> {
        let entry = Entry::new(service, account)?;
        match entry.get_secret() {
            Ok(secret) => Ok(secret),
            Err(keyring::Error::NoEntry) => Err(KeyringError::NotFound),
            Err(e) => Err(KeyringError::Keyring(e)),
        }
    }

    fn add(&self, service: &str, account: &str, secret: &[u8]) -> Result<(), KeyringError> {
        let entry = Entry::new(service, account)?;
        entry.set_secret(secret)?;
        Ok(())
    }

    fn delete(&self, service: &str, account: &str) -> Result<(), KeyringError> {
        let entry = Entry::new(service, account)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeyringError::Keyring(e)),
        }
    }
}

/// Process-local store, used by tests and scratch runs
#[derive(Debug, Default)]
pub struct MemoryKeyring {
    entries: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), Vec<u8>>>, KeyringError> {
        self.entries
            .lock()
            .map_err(|_| KeyringError::Backend("memory keyring poisoned".to_string()))
    }
}

impl SecretBackend for MemoryKeyring {
    fn get(&self, service: &str, account: &str) -> Result<Vec<u8>, KeyringError> {
        self.entries()?
            .get(&(service.to_string(), account.to_string()))
            .cloned()
            .ok_or(KeyringError::NotFound)
    }

    fn add(&self, service: &str, account: &str, secret: &[u8]) -> Result<(), KeyringError> {
        let mut entries = self.entries()?;
        let key = (service.to_string(), account.to_string());
        // Mirrors the platform stores: adding over a live entry is a duplicate.
        if entries.contains_key(&key) {
            return Err(KeyringError::Backend(format!(
                "duplicate item for {}/{}",
                service, account
            )));
        }
        entries.insert(key, secret.to_vec());
        Ok(())
    }

    fn delete(&self, service: &str, account: &str) -> Result<(), KeyringError> {
        self.entries()?
            .remove(&(service.to_string(), account.to_string()));
        Ok(())
    }
}

/// Secure storage wrapper bound to one keyring service (namespace)
#[derive(Clone)]
pub struct SecureStorage {
    service: String,
    backend: Arc<dyn SecretBackend>,
}

impl SecureStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_backend(service, Arc::new(SystemKeyring))
    }

    pub fn with_backend(service: impl Into<String>, backend: Arc<dyn SecretBackend>) -> Self {
        Self {
            service: service.into(),
            backend,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Replace a credential: delete whatever is there, then add the new value.
    ///
    /// Never updates in place, so the store can't end up holding two items
    /// for the same key.
    pub fn replace(&self, key: &str, value: &[u8]) -> Result<(), KeyringError> {
        if let Err(err) = self.backend.delete(&self.service, key) {
            tracing::debug!("Pre-delete of {}/{} failed: {}", self.service, key, err);
        }
        self.backend.add(&self.service, key, value)?;
        tracing::debug!("Stored credential for key: {}", key);
        Ok(())
    }

    /// Retrieve a credential from the keyring
    pub fn get(&self, key: &str) -> Result<Vec<u8>, KeyringError> {
        self.backend.get(&self.service, key)
    }

    /// Delete a credential; a missing entry is fine
    pub fn delete(&self, key: &str) -> Result<(), KeyringError> {
        self.backend.delete(&self.service, key)?;
        tracing::debug!("Deleted credential for key: {}", key);
        Ok(())
    }

    /// Check if a credential exists
    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_ok()
    }
}
