//! Credential bridge into Claude Code
//!
//! Exchanges an account's session secret for OAuth tokens, stores them where
//! Claude Code looks for its login, and points Claude Code's config at the
//! account's organization.

mod config_file;

pub use config_file::{merge_oauth_account, read_config};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::config::BridgeConfig;
use crate::oauth::{AuthError, OAuthTokens, TokenExchanger};
use crate::storage::SecureStorage;

/// Scopes Claude Code expects on its stored credential, whatever was granted
pub const CLAUDE_CODE_SCOPES: [&str; 4] = [
    "user:inference",
    "user:mcp_servers",
    "user:profile",
    "user:sessions:claude_code",
];

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Exchange(#[from] AuthError),
    #[error("Failed to write Claude Code credential: {0}")]
    CredentialWrite(String),
    #[error("Failed to update {}: {message}", .path.display())]
    ConfigWrite { path: PathBuf, message: String },
}

#[async_trait]
pub trait CredentialSwitcher: Send + Sync {
    async fn bridge(&self, secret: &str, org_id: &str, org_name: &str) -> Result<(), BridgeError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialRecord<'a> {
    access_token: &'a str,
    refresh_token: &'a str,
    expires_at: i64,
    scopes: [&'a str; 4],
    #[serde(skip_serializing_if = "Option::is_none")]
    subscription_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rate_limit_tier: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialEnvelope<'a> {
    claude_ai_oauth: CredentialRecord<'a>,
}

fn credential_blob(tokens: &OAuthTokens) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&CredentialEnvelope {
        claude_ai_oauth: CredentialRecord {
            access_token: &tokens.access_token,
            refresh_token: &tokens.refresh_token,
            expires_at: tokens.expires_at,
            scopes: CLAUDE_CODE_SCOPES,
            subscription_type: tokens.subscription_type.as_deref(),
            rate_limit_tier: tokens.rate_limit_tier.as_deref(),
        },
    })
}

pub struct CredentialBridge {
    exchanger: Arc<dyn TokenExchanger>,
    storage: SecureStorage,
    account_key: String,
    config_path: PathBuf,
}

impl CredentialBridge {
    pub fn new(exchanger: Arc<dyn TokenExchanger>, config: &BridgeConfig) -> Self {
        Self::with_storage(
            exchanger,
            SecureStorage::new(config.keyring_service.clone()),
            config.keyring_account.clone(),
            config.config_path.clone(),
        )
    }

    pub fn with_storage(
        exchanger: Arc<dyn TokenExchanger>,
        storage: SecureStorage,
        account_key: impl Into<String>,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            exchanger,
            storage,
            account_key: account_key.into(),
            config_path: config_path.into(),
        }
    }

    fn write_credential(&self, tokens: &OAuthTokens) -> Result<(), BridgeError> {
        let blob = credential_blob(tokens).map_err(|e| BridgeError::CredentialWrite(e.to_string()))?;
        self.storage
            .replace(&self.account_key, &blob)
            .map_err(|e| BridgeError::CredentialWrite(e.to_string()))
    }
}

#[async_trait]
impl CredentialSwitcher for CredentialBridge {
    async fn bridge(&self, secret: &str, org_id: &str, org_name: &str) -> Result<(), BridgeError> {
        let tokens = self.exchanger.exchange(secret).await?;

        self.write_credential(&tokens)?;
        tracing::info!(
            "Wrote Claude Code credential to {}/{}",
            self.storage.service(),
            self.account_key
        );

        if let Err(err) = merge_oauth_account(&self.config_path, org_id, org_name) {
            // No rollback: the credential above now belongs to a different
            // organization than the one the config names.
            tracing::warn!(
                "Claude Code credential updated but {} was not; they now disagree: {}",
                self.config_path.display(),
                err
            );
            return Err(BridgeError::ConfigWrite {
                path: self.config_path.clone(),
                message: err.to_string(),
            });
        }

        tracing::info!("Bridged organization {} into Claude Code", org_name);
        Ok(())
    }
}
