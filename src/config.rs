//! Runtime configuration
//!
//! Every endpoint, interval, keyring namespace and path the engine touches lives
//! here. Defaults target the production Claude endpoints; `from_env` layers
//! environment overrides on top so tests and scratch setups can redirect them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

pub const DEFAULT_API_BASE_URL: &str = "https://claude.ai/api";
pub const DEFAULT_AUTHORIZE_URL: &str = "https://claude.ai/oauth/authorize";
pub const DEFAULT_TOKEN_URL: &str = "https://platform.claude.com/v1/oauth/token";
pub const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
pub const DEFAULT_SCOPES: &str = "user:inference user:profile user:sessions:claude_code user:mcp_servers";

pub const DEFAULT_VAULT_SERVICE: &str = "com.claude-usage.app";
pub const DEFAULT_VAULT_KEY: &str = "accounts";
pub const DEFAULT_CLAUDE_CODE_SERVICE: &str = "Claude Code-credentials";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BRIDGE_NOTICE_SECS: u64 = 3;

/// OAuth endpoints and client parameters used by the credential broker
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub authorize_url: String,
    pub token_url: String,
    pub scopes: String,
    pub callback_timeout: Duration,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            authorize_url: DEFAULT_AUTHORIZE_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            scopes: DEFAULT_SCOPES.to_string(),
            callback_timeout: Duration::from_secs(DEFAULT_CALLBACK_TIMEOUT_SECS),
        }
    }
}

/// Where the second application (Claude Code) keeps its credential and config
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub keyring_service: String,
    pub keyring_account: String,
    pub config_path: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            keyring_service: DEFAULT_CLAUDE_CODE_SERVICE.to_string(),
            keyring_account: current_user_name(),
            config_path: default_claude_code_config_path(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_base_url: String,
    pub poll_interval: Duration,
    pub bridge_notice_ttl: Duration,
    pub vault_service: String,
    pub vault_key: String,
    pub oauth: OAuthConfig,
    pub bridge: BridgeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            bridge_notice_ttl: Duration::from_secs(DEFAULT_BRIDGE_NOTICE_SECS),
            vault_service: DEFAULT_VAULT_SERVICE.to_string(),
            vault_key: DEFAULT_VAULT_KEY.to_string(),
            oauth: OAuthConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl AppConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::default();

        if let Some(url) = read("CLAUDE_USAGE_API_BASE") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = read("CLAUDE_USAGE_AUTHORIZE_URL") {
            config.oauth.authorize_url = url;
        }
        if let Some(url) = read("CLAUDE_USAGE_TOKEN_URL") {
            config.oauth.token_url = url;
        }
        if let Some(secs) = read("CLAUDE_USAGE_POLL_SECS") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("CLAUDE_USAGE_POLL_SECS is not a number: {secs}"))?;
            if secs == 0 {
                bail!("CLAUDE_USAGE_POLL_SECS must be greater than zero");
            }
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(service) = read("CLAUDE_USAGE_KEYRING_SERVICE") {
            config.vault_service = service;
        }
        if let Some(service) = read("CLAUDE_CODE_KEYRING_SERVICE") {
            config.bridge.keyring_service = service;
        }
        if let Some(path) = read("CLAUDE_CODE_CONFIG") {
            config.bridge.config_path = PathBuf::from(path);
        }

        Ok(config)
    }
}

fn current_user_name() -> String {
    ["USER", "USERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| "claude-code".to_string())
}

fn default_claude_code_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join(".claude.json")
}
