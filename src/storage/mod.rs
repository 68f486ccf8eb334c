//! Storage utilities for credentials and local files

pub mod atomic_file;
pub mod keyring;
pub mod vault;

// Re-export commonly used items
pub use atomic_file::write_file_atomic;
pub use keyring::{KeyringError, MemoryKeyring, SecretBackend, SecureStorage, SystemKeyring};
pub use vault::{AccountVault, VaultError};
