//! Account registry
//!
//! Owns the account list, the latest usage snapshot and error per account,
//! the primary selection and the credential-bridge status. All mutation goes
//! through one `RwLock`; network fetches run concurrently outside it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};

use super::account::normalize_alias;
use super::{Account, AccountId};
use crate::bridge::{BridgeError, CredentialBridge, CredentialSwitcher};
use crate::config::AppConfig;
use crate::oauth::CredentialBroker;
use crate::storage::{AccountVault, SecureStorage};
use crate::usage::{ApiError, UsageClient, UsageSnapshot, UsageSource};

const NO_USAGE_TEXT: &str = "—%";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Account {0} is already tracked")]
    DuplicateAccount(AccountId),
    #[error("Unknown account {0}")]
    UnknownAccount(AccountId),
    #[error("Another account is being bridged")]
    BridgeBusy,
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("Bridge task failed: {0}")]
    BridgeTask(String),
}

/// Last fetch failure for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingError {
    pub message: String,
    /// The secret was rejected; logging in again is the fix
    pub session_expired: bool,
}

impl From<&ApiError> for PollingError {
    fn from(err: &ApiError) -> Self {
        Self {
            message: err.to_string(),
            session_expired: err.is_session_expired(),
        }
    }
}

/// Per-account view, in display order
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRow {
    pub id: AccountId,
    pub name: String,
    pub organization: String,
    pub is_primary: bool,
    pub is_bridged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PollingError>,
}

struct BridgeNotice {
    message: String,
    token: u64,
}

#[derive(Default)]
struct RegistryState {
    accounts: Vec<Account>,
    usage: HashMap<AccountId, UsageSnapshot>,
    errors: HashMap<AccountId, PollingError>,
    primary: Option<AccountId>,
    bridging: Option<AccountId>,
    bridged: Option<AccountId>,
    bridge_notice: Option<BridgeNotice>,
}

impl RegistryState {
    fn account(&self, id: AccountId) -> Result<&Account, RegistryError> {
        self.accounts
            .iter()
            .find(|account| account.id == id)
            .ok_or(RegistryError::UnknownAccount(id))
    }

    fn account_mut(&mut self, id: AccountId) -> Result<&mut Account, RegistryError> {
        self.accounts
            .iter_mut()
            .find(|account| account.id == id)
            .ok_or(RegistryError::UnknownAccount(id))
    }
}

struct PollingTask {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct RegistryInner {
    vault: AccountVault,
    source: Arc<dyn UsageSource>,
    switcher: Arc<dyn CredentialSwitcher>,
    poll_interval: Duration,
    notice_ttl: Duration,
    state: RwLock<RegistryState>,
    polling: Mutex<Option<PollingTask>>,
    refreshes: AtomicUsize,
    notice_seq: AtomicU64,
}

/// Decrements the in-flight refresh count even if the refresh is dropped
struct LoadingGuard<'a>(&'a AtomicUsize);

impl<'a> LoadingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Clone)]
pub struct AccountRegistry {
    inner: Arc<RegistryInner>,
}

impl AccountRegistry {
    pub fn new(
        vault: AccountVault,
        source: Arc<dyn UsageSource>,
        switcher: Arc<dyn CredentialSwitcher>,
        poll_interval: Duration,
        notice_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                vault,
                source,
                switcher,
                poll_interval,
                notice_ttl,
                state: RwLock::new(RegistryState::default()),
                polling: Mutex::new(None),
                refreshes: AtomicUsize::new(0),
                notice_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Registry wired to the system keyring, the Claude web API and the
    /// Claude Code bridge
    pub fn from_config(config: &AppConfig) -> Self {
        let vault = AccountVault::new(SecureStorage::new(config.vault_service.clone()), config.vault_key.clone());
        let broker = Arc::new(CredentialBroker::new(config.oauth.clone()));
        let bridge = Arc::new(CredentialBridge::new(broker, &config.bridge));

        Self::new(
            vault,
            Arc::new(UsageClient::new(config.api_base_url.clone())),
            bridge,
            config.poll_interval,
            config.bridge_notice_ttl,
        )
    }

    fn persist(&self, accounts: &[Account]) {
        if let Err(err) = self.inner.vault.save(accounts) {
            tracing::warn!("Failed to persist accounts: {}", err);
        }
    }

    /// Replace in-memory state with the stored accounts; no polling
    pub async fn restore(&self) -> usize {
        let accounts = self.inner.vault.load();
        let count = accounts.len();

        let mut state = self.inner.state.write().await;
        state.primary = accounts.first().map(|account| account.id);
        state.accounts = accounts;
        state.usage.clear();
        state.errors.clear();

        tracing::info!("Loaded {} account(s)", count);
        count
    }

    /// Restore, then poll when there is anything to poll
    pub async fn load(&self) {
        if self.restore().await > 0 {
            self.start_polling();
        }
    }

    pub async fn add(&self, account: Account) -> Result<(), RegistryError> {
        {
            let mut state = self.inner.state.write().await;
            if state.accounts.iter().any(|existing| existing.id == account.id) {
                return Err(RegistryError::DuplicateAccount(account.id));
            }
            tracing::info!("Adding account {}", account.display_name());
            if state.primary.is_none() {
                state.primary = Some(account.id);
            }
            state.accounts.push(account);
            self.persist(&state.accounts);
        }

        self.start_polling();
        Ok(())
    }

    pub async fn remove(&self, id: AccountId) -> Result<Account, RegistryError> {
        let (removed, now_empty) = {
            let mut state = self.inner.state.write().await;
            let index = state
                .accounts
                .iter()
                .position(|account| account.id == id)
                .ok_or(RegistryError::UnknownAccount(id))?;

            let removed = state.accounts.remove(index);
            state.usage.remove(&id);
            state.errors.remove(&id);
            if state.primary == Some(id) {
                state.primary = state.accounts.first().map(|account| account.id);
            }
            if state.bridged == Some(id) {
                state.bridged = None;
            }
            self.persist(&state.accounts);
            (removed, state.accounts.is_empty())
        };

        tracing::info!("Removed account {}", removed.display_name());
        if now_empty {
            self.stop_polling();
        }
        Ok(removed)
    }

    pub async fn set_primary(&self, id: AccountId) -> Result<(), RegistryError> {
        let mut state = self.inner.state.write().await;
        state.account(id)?;
        state.primary = Some(id);
        Ok(())
    }

    /// Set or clear (blank) the alias
    pub async fn rename(&self, id: AccountId, alias: Option<String>) -> Result<(), RegistryError> {
        let mut state = self.inner.state.write().await;
        let account = state.account_mut(id)?;
        account.alias = normalize_alias(alias);
        tracing::info!("Renamed account {} to {}", id, account.display_name());
        self.persist(&state.accounts);
        Ok(())
    }

    /// Swap the secret, clear the account's error and refresh in the
    /// background. The returned handle may be awaited or dropped.
    pub async fn update_secret(&self, id: AccountId, secret: &str) -> Result<JoinHandle<()>, RegistryError> {
        {
            let mut state = self.inner.state.write().await;
            state.account_mut(id)?.secret = secret.trim().to_string();
            state.errors.remove(&id);
            self.persist(&state.accounts);
        }

        tracing::info!("Updated session key for account {}", id);
        let registry = self.clone();
        Ok(tokio::spawn(async move {
            registry.refresh_all().await;
        }))
    }

    /// Fetch usage for every account concurrently and wait for all of them.
    ///
    /// Each result lands as soon as it arrives. A failure only touches that
    /// account's error slot; its previous snapshot stays.
    pub async fn refresh_all(&self) {
        let targets: Vec<(AccountId, String, String)> = {
            let state = self.inner.state.read().await;
            state
                .accounts
                .iter()
                .map(|account| (account.id, account.secret.clone(), account.organization_id.clone()))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let _loading = LoadingGuard::new(&self.inner.refreshes);
        tracing::debug!("Refreshing usage for {} account(s)", targets.len());

        let mut tasks = JoinSet::new();
        for (id, secret, organization_id) in targets {
            let source = self.inner.source.clone();
            tasks.spawn(async move {
                let result = source.fetch_usage(&secret, &organization_id).await;
                (id, secret, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, secret, result)) => self.apply_result(id, &secret, result).await,
                Err(err) => tracing::warn!("Usage refresh task failed: {}", err),
            }
        }
    }

    async fn apply_result(&self, id: AccountId, secret: &str, result: Result<UsageSnapshot, ApiError>) {
        let mut state = self.inner.state.write().await;
        // Removed or re-keyed while the request was in flight
        let current = state.accounts.iter().any(|account| account.id == id && account.secret == secret);
        if !current {
            tracing::debug!("Discarding stale usage result for {}", id);
            return;
        }

        match result {
            Ok(snapshot) => {
                state.usage.insert(id, snapshot);
                state.errors.remove(&id);
            }
            Err(err) => {
                tracing::warn!("Usage fetch failed for {}: {}", id, err);
                state.errors.insert(id, PollingError::from(&err));
            }
        }
    }

    /// Stop any running loop, then refresh now and every poll interval
    pub fn start_polling(&self) {
        self.stop_polling();

        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.poll_interval;

        let handle = tokio::spawn(async move {
            loop {
                if flag.load(Ordering::Acquire) {
                    break;
                }
                let Some(inner) = weak.upgrade() else { break };
                AccountRegistry { inner }.refresh_all().await;

                if flag.load(Ordering::Acquire) {
                    break;
                }
                tokio::time::sleep(interval).await;
            }
            tracing::debug!("Polling loop exited");
        });

        if let Ok(mut polling) = self.inner.polling.lock() {
            *polling = Some(PollingTask { cancel, handle });
        }
        tracing::info!("Started polling every {:?}", interval);
    }

    /// Ask the loop to stop; a refresh already running finishes first
    pub fn stop_polling(&self) {
        let task = match self.inner.polling.lock() {
            Ok(mut polling) => polling.take(),
            Err(_) => None,
        };
        if let Some(task) = task {
            task.cancel.store(true, Ordering::Release);
            tracing::info!("Stopped polling");
        }
    }

    pub fn is_polling(&self) -> bool {
        match self.inner.polling.lock() {
            Ok(polling) => polling
                .as_ref()
                .is_some_and(|task| !task.handle.is_finished() && !task.cancel.load(Ordering::Acquire)),
            Err(_) => false,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.inner.refreshes.load(Ordering::Acquire) > 0
    }

    /// Mirror an account into Claude Code.
    ///
    /// Only one bridge runs at a time. A failure is kept as a notice that
    /// clears itself after the notice lifetime unless a newer bridge has
    /// replaced it.
    pub async fn switch_credential_bridge(&self, id: AccountId) -> Result<(), RegistryError> {
        let account = {
            let mut state = self.inner.state.write().await;
            if state.bridging.is_some() {
                return Err(RegistryError::BridgeBusy);
            }
            let account = state.account(id)?.clone();
            state.bridging = Some(id);
            state.bridge_notice = None;
            account
        };

        tracing::info!("Bridging {} into Claude Code", account.display_name());
        // The bridge owns the marker from here; dropping this future must not
        // leave it set.
        let registry = self.clone();
        let task = tokio::spawn(async move { registry.finish_bridge(account).await });

        match task.await {
            Ok(result) => result,
            Err(err) => {
                let mut state = self.inner.state.write().await;
                if state.bridging == Some(id) {
                    state.bridging = None;
                }
                Err(RegistryError::BridgeTask(err.to_string()))
            }
        }
    }

    async fn finish_bridge(&self, account: Account) -> Result<(), RegistryError> {
        let result = self
            .inner
            .switcher
            .bridge(&account.secret, &account.organization_id, &account.organization_name)
            .await;

        let mut state = self.inner.state.write().await;
        state.bridging = None;
        match result {
            Ok(()) => {
                state.bridged = Some(account.id);
                Ok(())
            }
            Err(err) => {
                tracing::warn!("Bridge failed for {}: {}", account.display_name(), err);
                let token = self.inner.notice_seq.fetch_add(1, Ordering::AcqRel) + 1;
                state.bridge_notice = Some(BridgeNotice {
                    message: err.to_string(),
                    token,
                });
                drop(state);
                self.expire_notice(token);
                Err(err.into())
            }
        }
    }

    fn expire_notice(&self, token: u64) {
        let weak = Arc::downgrade(&self.inner);
        let ttl = self.inner.notice_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(inner) = weak.upgrade() else { return };
            let mut state = inner.state.write().await;
            if state.bridge_notice.as_ref().is_some_and(|notice| notice.token == token) {
                state.bridge_notice = None;
            }
        });
    }

    /// Drop every account, locally and in storage
    pub async fn clear(&self) {
        self.stop_polling();
        {
            let mut state = self.inner.state.write().await;
            *state = RegistryState::default();
        }
        self.inner.vault.delete_all();
        tracing::info!("Cleared all accounts");
    }

    pub async fn accounts(&self) -> Vec<Account> {
        self.inner.state.read().await.accounts.clone()
    }

    pub async fn account(&self, id: AccountId) -> Option<Account> {
        self.inner.state.read().await.account(id).ok().cloned()
    }

    /// Full id, unique id prefix, or case-insensitive display name
    pub async fn find(&self, query: &str) -> Option<Account> {
        let query = query.trim();
        if query.is_empty() {
            return None;
        }
        let state = self.inner.state.read().await;

        if let Some(account) = state.accounts.iter().find(|a| a.id.to_string() == query) {
            return Some(account.clone());
        }

        let lowered = query.to_lowercase();
        let mut by_prefix = state
            .accounts
            .iter()
            .filter(|a| a.id.to_string().starts_with(&lowered));
        if let (Some(account), None) = (by_prefix.next(), by_prefix.next()) {
            return Some(account.clone());
        }

        state
            .accounts
            .iter()
            .find(|a| a.display_name().to_lowercase() == lowered)
            .cloned()
    }

    pub async fn usage(&self, id: AccountId) -> Option<UsageSnapshot> {
        self.inner.state.read().await.usage.get(&id).cloned()
    }

    pub async fn error(&self, id: AccountId) -> Option<PollingError> {
        self.inner.state.read().await.errors.get(&id).cloned()
    }

    pub async fn primary_id(&self) -> Option<AccountId> {
        self.inner.state.read().await.primary
    }

    pub async fn primary_usage(&self) -> Option<UsageSnapshot> {
        let state = self.inner.state.read().await;
        state.primary.and_then(|id| state.usage.get(&id).cloned())
    }

    pub async fn bridging(&self) -> Option<AccountId> {
        self.inner.state.read().await.bridging
    }

    pub async fn bridged(&self) -> Option<AccountId> {
        self.inner.state.read().await.bridged
    }

    pub async fn bridge_notice(&self) -> Option<String> {
        self.inner
            .state
            .read()
            .await
            .bridge_notice
            .as_ref()
            .map(|notice| notice.message.clone())
    }

    /// `"{session}%"` for the primary account, `"—%"` without data
    pub async fn menu_bar_text(&self) -> String {
        match self.primary_usage().await {
            Some(usage) => format!("{}%", usage.session_percentage()),
            None => NO_USAGE_TEXT.to_string(),
        }
    }

    pub async fn rows(&self) -> Vec<AccountRow> {
        let state = self.inner.state.read().await;
        state
            .accounts
            .iter()
            .map(|account| AccountRow {
                id: account.id,
                name: account.display_name().to_string(),
                organization: account.organization_name.clone(),
                is_primary: state.primary == Some(account.id),
                is_bridged: state.bridged == Some(account.id),
                usage: state.usage.get(&account.id).cloned(),
                error: state.errors.get(&account.id).cloned(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::AuthError;
    use crate::storage::MemoryKeyring;
    use crate::usage::{Organization, UsageBucket};
    use async_trait::async_trait;

    /// Answers by secret: `expired*` is rejected, anything else gets a fixed
    /// session utilization
    struct FakeSource {
        utilization: Mutex<f64>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                utilization: Mutex::new(25.0),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UsageSource for FakeSource {
        async fn fetch_organizations(&self, _secret: &str) -> Result<Vec<Organization>, ApiError> {
            Ok(Vec::new())
        }

        async fn fetch_usage(&self, secret: &str, _org_id: &str) -> Result<UsageSnapshot, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if secret.starts_with("expired") {
                return Err(ApiError::Unauthorized);
            }
            Ok(UsageSnapshot {
                five_hour: Some(UsageBucket {
                    utilization: *self.utilization.lock().unwrap(),
                    resets_at: None,
                }),
                ..Default::default()
            })
        }
    }

    struct FakeSwitcher {
        fail: AtomicBool,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FakeSwitcher {
        fn new(fail: bool) -> Self {
            Self {
                fail: AtomicBool::new(fail),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl CredentialSwitcher for FakeSwitcher {
        async fn bridge(&self, _secret: &str, _org_id: &str, _org_name: &str) -> Result<(), BridgeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(BridgeError::Exchange(AuthError::ExchangeFailed(format!("attempt {}", call))));
            }
            Ok(())
        }
    }

    struct Fixture {
        registry: AccountRegistry,
        source: Arc<FakeSource>,
        switcher: Arc<FakeSwitcher>,
        vault: AccountVault,
    }

    fn fixture_with(source: FakeSource, switcher: FakeSwitcher) -> Fixture {
        let vault = AccountVault::new(
            SecureStorage::with_backend("registry-test", Arc::new(MemoryKeyring::new())),
            "accounts",
        );
        let source = Arc::new(source);
        let switcher = Arc::new(switcher);
        let registry = AccountRegistry::new(
            vault.clone(),
            source.clone(),
            switcher.clone(),
            Duration::from_secs(60),
            Duration::from_secs(3),
        );
        Fixture {
            registry,
            source,
            switcher,
            vault,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FakeSource::new(), FakeSwitcher::new(false))
    }

    /// Lets every ready task run; the paused clock only moves once the
    /// runtime is idle
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_add_becomes_primary_and_persists() {
        let f = fixture();
        let first = Account::new("sk-1", "org-1", "Acme");
        let second = Account::new("sk-2", "org-2", "Side");

        f.registry.add(first.clone()).await.expect("add first");
        f.registry.add(second.clone()).await.expect("add second");

        assert_eq!(f.registry.primary_id().await, Some(first.id));
        assert_eq!(f.vault.load(), vec![first.clone(), second]);
        assert!(f.registry.is_polling());

        let err = f.registry.add(first).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateAccount(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_isolates_failures() {
        let f = fixture();
        let good = Account::new("sk-good", "org-1", "Good");
        let bad = Account::new("expired-sk", "org-2", "Bad");
        f.vault.save(&[good.clone(), bad.clone()]).expect("seed");
        f.registry.restore().await;

        // Give B a prior snapshot by refreshing it under a working secret
        f.registry.update_secret(bad.id, "sk-working").await.expect("update");
        settle().await;
        let prior = f.registry.usage(bad.id).await.expect("prior snapshot");

        f.registry.update_secret(bad.id, "expired-again").await.expect("update");
        *f.source.utilization.lock().unwrap() = 80.0;
        f.registry.refresh_all().await;

        let good_usage = f.registry.usage(good.id).await.expect("good usage");
        assert_eq!(good_usage.session_percentage(), 80);
        assert!(f.registry.error(good.id).await.is_none());

        let error = f.registry.error(bad.id).await.expect("bad error");
        assert!(error.session_expired);
        assert_eq!(error.message, "Session expired");
        assert_eq!(f.registry.usage(bad.id).await, Some(prior));
    }

    #[tokio::test(start_paused = true)]
    async fn update_secret_clears_error_and_refreshes() {
        let f = fixture();
        let account = Account::new("expired", "org-1", "Acme");
        f.vault.save(&[account.clone()]).expect("seed");
        f.registry.restore().await;

        f.registry.refresh_all().await;
        assert!(f.registry.error(account.id).await.is_some());

        let refresh = f.registry.update_secret(account.id, " sk-fresh ").await.expect("update");
        assert!(f.registry.error(account.id).await.is_none());
        assert_eq!(f.vault.load()[0].secret, "sk-fresh");

        // Awaiting the returned handle is one refresh round, not two
        refresh.await.expect("refresh");
        settle().await;
        assert_eq!(f.source.calls(), 2);
        assert_eq!(f.registry.menu_bar_text().await, "25%");
    }

    #[tokio::test(start_paused = true)]
    async fn removing_primary_reassigns_and_last_remove_stops_polling() {
        let f = fixture();
        let first = Account::new("sk-1", "org-1", "Acme");
        let second = Account::new("sk-2", "org-2", "Side");
        f.registry.add(first.clone()).await.expect("add");
        f.registry.add(second.clone()).await.expect("add");
        settle().await;
        assert!(f.registry.usage(first.id).await.is_some());

        f.registry.remove(first.id).await.expect("remove");
        assert_eq!(f.registry.primary_id().await, Some(second.id));
        assert!(f.registry.usage(first.id).await.is_none());
        assert!(f.registry.is_polling());

        let calls_before = f.source.calls();
        f.registry.remove(second.id).await.expect("remove");
        assert_eq!(f.registry.primary_id().await, None);
        assert!(!f.registry.is_polling());

        tokio::time::sleep(Duration::from_secs(130)).await;
        settle().await;
        assert_eq!(f.source.calls(), calls_before);
        assert!(f.vault.load().is_empty());
        assert_eq!(f.registry.menu_bar_text().await, "—%");

        let err = f.registry.remove(second.id).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownAccount(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn starting_twice_runs_one_loop() {
        let f = fixture();
        f.vault.save(&[Account::new("sk-1", "org-1", "Acme")]).expect("seed");
        f.registry.restore().await;

        f.registry.start_polling();
        f.registry.start_polling();
        settle().await;
        assert_eq!(f.source.calls(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(f.source.calls(), 2);

        f.registry.stop_polling();
        assert!(!f.registry.is_polling());
        tokio::time::sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(f.source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn load_with_no_accounts_does_not_poll() {
        let f = fixture();
        f.registry.load().await;
        assert!(!f.registry.is_polling());
        assert!(f.registry.accounts().await.is_empty());

        f.vault.save(&[Account::new("sk-1", "org-1", "Acme")]).expect("seed");
        f.registry.load().await;
        assert!(f.registry.is_polling());
        assert!(f.registry.primary_id().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_result_for_removed_account_is_dropped() {
        let mut source = FakeSource::new();
        source.delay = Duration::from_secs(5);
        let f = fixture_with(source, FakeSwitcher::new(false));
        let account = Account::new("sk-1", "org-1", "Acme");
        f.vault.save(&[account.clone()]).expect("seed");
        f.registry.restore().await;

        let registry = f.registry.clone();
        let refresh = tokio::spawn(async move { registry.refresh_all().await });
        settle().await;
        assert!(f.registry.is_loading());

        f.registry.remove(account.id).await.expect("remove");
        refresh.await.expect("join");

        assert!(!f.registry.is_loading());
        assert!(f.registry.usage(account.id).await.is_none());
        assert!(f.registry.rows().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rename_and_primary_selection() {
        let f = fixture();
        let first = Account::new("sk-1", "org-1", "Acme");
        let second = Account::new("sk-2", "org-2", "Side");
        f.vault.save(&[first.clone(), second.clone()]).expect("seed");
        f.registry.restore().await;

        f.registry.rename(second.id, Some("Personal".to_string())).await.expect("rename");
        f.registry.set_primary(second.id).await.expect("primary");

        let rows = f.registry.rows().await;
        assert_eq!(rows[1].name, "Personal");
        assert!(rows[1].is_primary);
        assert!(!rows[0].is_primary);
        assert_eq!(f.vault.load()[1].alias.as_deref(), Some("Personal"));

        f.registry.rename(second.id, Some("  ".to_string())).await.expect("clear");
        assert_eq!(f.registry.rows().await[1].name, "Side");
    }

    #[tokio::test(start_paused = true)]
    async fn find_matches_id_prefix_and_name() {
        let f = fixture();
        let account = Account::new("sk-1", "org-1", "Acme").with_alias(Some("Work".to_string()));
        f.vault.save(&[account.clone(), Account::new("sk-2", "org-2", "Side")]).expect("seed");
        f.registry.restore().await;

        let id = account.id.to_string();
        assert_eq!(f.registry.find(&id).await, Some(account.clone()));
        assert_eq!(f.registry.find(&id[..13]).await, Some(account.clone()));
        assert_eq!(f.registry.find("work").await, Some(account));
        assert!(f.registry.find("nobody").await.is_none());
        assert!(f.registry.find("").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn bridge_success_marks_account() {
        let f = fixture();
        let account = Account::new("sk-1", "org-1", "Acme");
        f.vault.save(&[account.clone()]).expect("seed");
        f.registry.restore().await;

        f.registry.switch_credential_bridge(account.id).await.expect("bridge");

        assert_eq!(f.registry.bridged().await, Some(account.id));
        assert_eq!(f.registry.bridging().await, None);
        assert!(f.registry.bridge_notice().await.is_none());
        assert!(f.registry.rows().await[0].is_bridged);
    }

    #[tokio::test(start_paused = true)]
    async fn bridge_notice_expires_and_last_message_wins() {
        let f = fixture_with(FakeSource::new(), FakeSwitcher::new(true));
        let account = Account::new("sk-1", "org-1", "Acme");
        f.vault.save(&[account.clone()]).expect("seed");
        f.registry.restore().await;

        assert!(f.registry.switch_credential_bridge(account.id).await.is_err());
        assert!(f.registry.bridge_notice().await.expect("notice").contains("attempt 1"));
        assert_eq!(f.registry.bridging().await, None);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(f.registry.switch_credential_bridge(account.id).await.is_err());

        // First timer fires at 3s but the notice now belongs to attempt 2
        tokio::time::sleep(Duration::from_millis(1500)).await;
        settle().await;
        assert!(f.registry.bridge_notice().await.expect("notice").contains("attempt 2"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(f.registry.bridge_notice().await.is_none());
        assert_eq!(f.switcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_bridge_is_rejected() {
        let mut switcher = FakeSwitcher::new(false);
        switcher.delay = Duration::from_secs(1);
        let f = fixture_with(FakeSource::new(), switcher);
        let account = Account::new("sk-1", "org-1", "Acme");
        f.vault.save(&[account.clone()]).expect("seed");
        f.registry.restore().await;

        let registry = f.registry.clone();
        let id = account.id;
        let first = tokio::spawn(async move { registry.switch_credential_bridge(id).await });
        settle().await;
        assert_eq!(f.registry.bridging().await, Some(account.id));

        let err = f.registry.switch_credential_bridge(account.id).await.unwrap_err();
        assert!(matches!(err, RegistryError::BridgeBusy));

        first.await.expect("join").expect("bridge");
        assert_eq!(f.registry.bridging().await, None);
        assert_eq!(f.switcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_bridge_call_still_releases_marker() {
        let mut switcher = FakeSwitcher::new(false);
        switcher.delay = Duration::from_secs(10);
        let f = fixture_with(FakeSource::new(), switcher);
        let account = Account::new("sk-1", "org-1", "Acme");
        f.vault.save(&[account.clone()]).expect("seed");
        f.registry.restore().await;

        let timed_out = tokio::time::timeout(
            Duration::from_secs(1),
            f.registry.switch_credential_bridge(account.id),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(f.registry.bridging().await, Some(account.id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(f.registry.bridging().await, None);
        assert_eq!(f.registry.bridged().await, Some(account.id));

        f.registry.switch_credential_bridge(account.id).await.expect("second bridge");
        assert_eq!(f.switcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_forgets_everything() {
        let f = fixture();
        f.registry.add(Account::new("sk-1", "org-1", "Acme")).await.expect("add");
        f.registry.clear().await;

        assert!(f.registry.accounts().await.is_empty());
        assert!(!f.registry.is_polling());
        assert!(f.vault.load().is_empty());
    }
}
