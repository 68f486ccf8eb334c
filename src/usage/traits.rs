//! Usage source trait definition

use async_trait::async_trait;

use super::{ApiError, Organization, UsageSnapshot};

/// Anything that can answer usage queries for a session secret
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Organizations the secret can see
    async fn fetch_organizations(&self, secret: &str) -> Result<Vec<Organization>, ApiError>;

    /// Current usage buckets for one organization
    async fn fetch_usage(&self, secret: &str, org_id: &str) -> Result<UsageSnapshot, ApiError>;
}
