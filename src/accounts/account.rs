use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AccountId = Uuid;

/// One tracked Claude account.
///
/// Equality is by id only so a renamed or re-keyed account still matches
/// its earlier copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    #[serde(rename = "sessionKey")]
    pub secret: String,
    pub organization_id: String,
    pub organization_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(
        secret: impl Into<String>,
        organization_id: impl Into<String>,
        organization_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            secret: secret.into(),
            organization_id: organization_id.into(),
            organization_name: organization_name.into(),
            alias: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_alias(mut self, alias: Option<String>) -> Self {
        self.alias = normalize_alias(alias);
        self
    }

    /// Alias if set, otherwise the organization name
    pub fn display_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.organization_name)
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Account {}

/// Blank aliases clear the alias
pub(crate) fn normalize_alias(alias: Option<String>) -> Option<String> {
    alias
        .map(|alias| alias.trim().to_string())
        .filter(|alias| !alias.is_empty())
}
