//! Claude web API client
//!
//! Authenticates with the `sessionKey` cookie captured at login and sends the
//! same browser-identifying headers the web app does. Endpoints:
//! - /organizations - organizations visible to the session
//! - /organizations/{id}/usage - quota buckets for one organization

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{Organization, UsageSnapshot, UsageSource};

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

const WEB_ORIGIN: &str = "https://claude.ai";
const FORBIDDEN_BODY_PREFIX: usize = 200;
const BOT_BLOCK_MARKERS: [&str; 2] = ["cloudflare", "cf-"];

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Transport(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Session expired")]
    Unauthorized,
    #[error("{}", forbidden_message(.bot_blocked))]
    Forbidden { bot_blocked: bool },
    #[error("Rate limited")]
    RateLimited,
    #[error("HTTP {0}")]
    Http(u16),
}

fn forbidden_message(bot_blocked: &bool) -> &'static str {
    if *bot_blocked {
        "Blocked by Cloudflare"
    } else {
        "Forbidden (403)"
    }
}

impl ApiError {
    /// The one failure a user can fix by logging in again
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}

pub struct UsageClient {
    client: reqwest::Client,
    base_url: String,
}

impl UsageClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, secret: &str) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header("Cookie", format!("sessionKey={}", secret))
            .header("Accept", "application/json")
            .header("User-Agent", BROWSER_USER_AGENT)
            .header("Referer", WEB_ORIGIN)
            .header("Origin", WEB_ORIGIN)
            .header("Sec-Fetch-Site", "same-origin")
            .header("Sec-Fetch-Mode", "cors")
            .header("Sec-Fetch-Dest", "empty")
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        classify_status(status.as_u16(), &body)?;

        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

/// Map a non-2xx status to its error class
fn classify_status(status: u16, body: &[u8]) -> Result<(), ApiError> {
    match status {
        200..=299 => Ok(()),
        401 => Err(ApiError::Unauthorized),
        403 => Err(ApiError::Forbidden {
            bot_blocked: is_bot_block(body),
        }),
        429 => Err(ApiError::RateLimited),
        status => Err(ApiError::Http(status)),
    }
}

fn is_bot_block(body: &[u8]) -> bool {
    let prefix = &body[..body.len().min(FORBIDDEN_BODY_PREFIX)];
    let text = String::from_utf8_lossy(prefix).to_lowercase();
    BOT_BLOCK_MARKERS.iter().any(|marker| text.contains(marker))
}

#[async_trait]
impl UsageSource for UsageClient {
    async fn fetch_organizations(&self, secret: &str) -> Result<Vec<Organization>, ApiError> {
        self.get_json("/organizations", secret).await
    }

    async fn fetch_usage(&self, secret: &str, org_id: &str) -> Result<UsageSnapshot, ApiError> {
        tracing::debug!("Fetching usage for organization {}", org_id);
        self.get_json(&format!("/organizations/{}/usage", org_id), secret)
            .await
    }
}
