//! Tracked accounts: model, onboarding and the registry that polls them

mod account;
pub mod onboarding;
mod registry;

pub use account::{Account, AccountId};
pub use onboarding::{account_from_secret, OnboardingError};
pub use registry::{AccountRegistry, AccountRow, PollingError, RegistryError};
