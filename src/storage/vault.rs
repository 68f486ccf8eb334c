//! Account list persistence
//!
//! The whole account list is one JSON blob under a fixed (service, key) pair.
//! Loading is best-effort: anything unreadable means "no accounts".

use thiserror::Error;

use super::keyring::{KeyringError, SecureStorage};
use crate::accounts::Account;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Failed to encode accounts: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to save accounts: {0}")]
    SaveFailed(#[source] KeyringError),
}

#[derive(Clone)]
pub struct AccountVault {
    storage: SecureStorage,
    key: String,
}

impl AccountVault {
    pub fn new(storage: SecureStorage, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }

    pub fn save(&self, accounts: &[Account]) -> Result<(), VaultError> {
        let blob = serde_json::to_vec(accounts)?;
        self.storage
            .replace(&self.key, &blob)
            .map_err(VaultError::SaveFailed)?;
        tracing::debug!("Saved {} account(s) to {}", accounts.len(), self.storage.service());
        Ok(())
    }

    pub fn load(&self) -> Vec<Account> {
        let blob = match self.storage.get(&self.key) {
            Ok(blob) => blob,
            Err(KeyringError::NotFound) => return Vec::new(),
            Err(err) => {
                tracing::warn!("Failed to read stored accounts: {}", err);
                return Vec::new();
            }
        };

        match serde_json::from_slice::<Vec<Account>>(&blob) {
            Ok(accounts) => accounts,
            Err(err) => {
                tracing::warn!("Stored accounts are unreadable, starting empty: {}", err);
                Vec::new()
            }
        }
    }

    pub fn delete_all(&self) {
        if let Err(err) = self.storage.delete(&self.key) {
            tracing::warn!("Failed to delete stored accounts: {}", err);
        }
    }
}
