//! Turning a captured session secret into an account
//!
//! The browser login surface hands over the `sessionKey` cookie value; the
//! account is bound to the first organization that secret can see.

use super::Account;
use crate::usage::{ApiError, UsageSource};

#[derive(thiserror::Error, Debug)]
pub enum OnboardingError {
    #[error("Session key is empty")]
    EmptySecret,
    #[error("No organization found")]
    NoOrganization,
    #[error(transparent)]
    Api(#[from] ApiError),
}

pub async fn account_from_secret(
    source: &dyn UsageSource,
    secret: &str,
    alias: Option<String>,
) -> Result<Account, OnboardingError> {
    let secret = secret.trim();
    if secret.is_empty() {
        return Err(OnboardingError::EmptySecret);
    }

    let organizations = source.fetch_organizations(secret).await?;
    let organization = organizations
        .into_iter()
        .next()
        .ok_or(OnboardingError::NoOrganization)?;

    tracing::info!("Validated session for organization {}", organization.name);
    Ok(Account::new(secret, organization.id, organization.name).with_alias(alias))
}
