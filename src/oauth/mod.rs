//! Session-secret to OAuth token exchange (authorization code + PKCE)
//!
//! The authorize endpoint is driven with the web session cookie instead of a
//! browser. Its redirect lands on a loopback listener; the authorization code
//! comes from whichever of two paths reports first:
//! - the listener receiving the redirect
//! - the final URL of the authorize request after redirects are followed

mod callback;
mod pkce;

pub use callback::{find_available_port, CallbackListener, CALLBACK_PATH};
pub use pkce::{code_challenge, generate_verifier};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use url::Url;

use crate::config::OAuthConfig;
use crate::usage::BROWSER_USER_AGENT;

const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;
const ERROR_BODY_PREFIX: usize = 200;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Failed to bind callback listener: {0}")]
    BindFailed(#[source] std::io::Error),
    #[error("Timed out waiting for the OAuth callback")]
    Timeout,
    #[error("OAuth callback carried no code: {0}")]
    MissingCode(String),
    #[error("Token exchange failed: {0}")]
    ExchangeFailed(String),
    #[error("Token response had no tokens: {0}")]
    NoTokens(String),
    #[error("Invalid OAuth endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("OAuth callback wait cancelled")]
    Cancelled,
}

/// Tokens issued for one session secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Milliseconds since the Unix epoch
    pub expires_at: i64,
    pub scopes: Vec<String>,
    pub subscription_type: Option<String>,
    pub rate_limit_tier: Option<String>,
}

#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, secret: &str) -> Result<OAuthTokens, AuthError>;
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    code: &'a str,
    redirect_uri: &'a str,
    code_verifier: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    subscription_type: Option<String>,
    rate_limit_tier: Option<String>,
}

/// Completion slot shared by the two code sources; only the first write lands
struct FirstResult<T> {
    sender: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for FirstResult<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> FirstResult<T> {
    fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Returns false when another writer got there first
    fn complete(&self, value: T) -> bool {
        let sender = match self.sender.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match sender {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }
}

/// Raises the cancel flag when the exchange is dropped or finishes
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct CredentialBroker {
    client: reqwest::Client,
    config: OAuthConfig,
}

impl CredentialBroker {
    pub fn new(config: OAuthConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self { client, config }
    }

    fn authorize_url(&self, redirect_uri: &str, challenge: &str) -> Result<Url, AuthError> {
        Url::parse_with_params(
            &self.config.authorize_url,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("response_type", "code"),
                ("redirect_uri", redirect_uri),
                ("scope", self.config.scopes.as_str()),
                ("code_challenge", challenge),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| AuthError::InvalidEndpoint(format!("{}: {}", self.config.authorize_url, e)))
    }

    async fn authorization_code(
        &self,
        secret: &str,
        listener: CallbackListener,
        authorize_url: Url,
    ) -> Result<String, AuthError> {
        let (slot, winner) = FirstResult::new();
        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_guard = CancelOnDrop(cancel.clone());

        let listener_slot = slot.clone();
        let timeout = self.config.callback_timeout;
        tokio::spawn(async move {
            let result = listener.wait_for_code(timeout, cancel).await;
            if !listener_slot.complete(result) {
                tracing::debug!("Callback listener finished after the code was already delivered");
            }
        });

        let request = self
            .client
            .get(authorize_url)
            .header("Cookie", format!("sessionKey={}", secret))
            .header("User-Agent", BROWSER_USER_AGENT);
        tokio::spawn(async move {
            match request.send().await {
                Ok(response) => {
                    let final_url = response.url().clone();
                    let _ = response.bytes().await;
                    if final_url.path() != CALLBACK_PATH {
                        tracing::debug!("Authorize request ended at {} without a redirect", final_url.path());
                        return;
                    }
                    if let Ok(code) = callback::code_from_url(&final_url) {
                        slot.complete(Ok(code));
                    }
                }
                Err(err) => tracing::debug!("Authorize request failed: {}", err),
            }
        });

        winner.await.unwrap_or(Err(AuthError::Cancelled))
    }

    async fn exchange_code(
        &self,
        code: &str,
        verifier: &str,
        redirect_uri: &str,
    ) -> Result<OAuthTokens, AuthError> {
        tracing::debug!("Exchanging authorization code at {}", self.config.token_url);

        let body = TokenRequest {
            grant_type: "authorization_code",
            client_id: &self.config.client_id,
            code,
            redirect_uri,
            code_verifier: verifier,
        };

        let response = self
            .client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::ExchangeFailed(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AuthError::ExchangeFailed(e.to_string()))?;

        if !status.is_success() {
            let detail: String = text.chars().take(ERROR_BODY_PREFIX).collect();
            return Err(AuthError::ExchangeFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                detail
            )));
        }

        let token: TokenResponse =
            serde_json::from_str(&text).map_err(|e| AuthError::NoTokens(e.to_string()))?;
        self.tokens_from_response(token)
    }

    fn tokens_from_response(&self, token: TokenResponse) -> Result<OAuthTokens, AuthError> {
        let access_token = token
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::NoTokens("missing access_token".to_string()))?;
        let refresh_token = token
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::NoTokens("missing refresh_token".to_string()))?;

        let expires_in = token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let scope = token.scope.unwrap_or_else(|| self.config.scopes.clone());

        Ok(OAuthTokens {
            access_token,
            refresh_token,
            expires_at: Utc::now()
                .timestamp_millis()
                .saturating_add(expires_in.saturating_mul(1000)),
            scopes: scope.split_whitespace().map(str::to_string).collect(),
            subscription_type: token.subscription_type,
            rate_limit_tier: token.rate_limit_tier,
        })
    }
}

#[async_trait]
impl TokenExchanger for CredentialBroker {
    async fn exchange(&self, secret: &str) -> Result<OAuthTokens, AuthError> {
        let verifier = generate_verifier();
        let challenge = code_challenge(&verifier);

        let port = find_available_port()?;
        let redirect_uri = callback::redirect_uri(port);
        let authorize_url = self.authorize_url(&redirect_uri, &challenge)?;

        // Bound before the authorize request so the redirect can't arrive early
        let listener = CallbackListener::bind(port).await?;
        tracing::info!("Starting OAuth exchange via loopback port {}", port);

        let code = self
            .authorization_code(secret, listener, authorize_url)
            .await?;
        let tokens = self.exchange_code(&code, &verifier, &redirect_uri).await?;

        tracing::info!("OAuth exchange succeeded");
        Ok(tokens)
    }
}
