//! Key Manager. Owns the device key pair, its registration with the relay,
//! and the cache of other users' public keys.
//!
//! ```text
//! Uninitialized ──initialize()──▶ KeysGenerated ──register ok──▶ Registered
//!                                      │                             ▲
//!                                      └──register failed──▶ PendingRetry
//!                                              (backoff: min(2^n, 24) h)
//! ```
//!
//! One manager per identity, owned by the caller. Nothing here is global.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use rsa::RsaPublicKey;
use tokio::sync::OnceCell;

use crate::clock::{Clock, SystemClock, HOUR_MS};
use crate::config::ClientConfig;
use crate::crypto;
use crate::error::E2eeError;
use crate::keys::{self, LocalKeys};
use crate::network::{NetworkError, RegisterRequest, RelayClient};
use crate::store::{self, PersistedE2eeState, RegistrationRetryState, SettingsStore};

pub const PUBLIC_KEY_TTL_MS: i64 = 24 * HOUR_MS;
pub const MAX_BACKOFF_HOURS: i64 = 24;

/// Hours to wait after `failure_count` consecutive failed registrations.
pub fn backoff_wait_hours(failure_count: u32) -> i64 {
    2i64.saturating_pow(failure_count).min(MAX_BACKOFF_HOURS)
}

/// Earliest time (ms) the next background registration may run. A state
/// with no failures yet is due immediately.
pub fn next_attempt_at(retry: &RegistrationRetryState) -> i64 {
    if retry.failure_count == 0 {
        return retry.last_attempt_at;
    }
    retry
        .last_attempt_at
        .saturating_add(backoff_wait_hours(retry.failure_count) * HOUR_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Uninitialized,
    KeysGenerated,
    Registered,
    PendingRetry,
}

/// Outcome of a registration pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    Registered,
    /// Attempted and failed; retried in the background after `retry_at`.
    Pending { failure_count: u32, retry_at: i64 },
    /// Backoff window still open, nothing was sent.
    Deferred { retry_at: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyCacheEntry {
    pub user_id: String,
    pub public_key_pem: String,
    pub key_id: String,
    pub fetched_at: i64,
}

pub struct KeyManager<S, R> {
    store: S,
    relay: R,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    local: OnceCell<LocalKeys>,
    phase: Mutex<KeyState>,
    /// Serialises registration passes so concurrent callers see each other's result.
    registration_gate: tokio::sync::Mutex<()>,
    cache: Mutex<HashMap<String, PublicKeyCacheEntry>>,
}

pub(crate) fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<S: SettingsStore, R: RelayClient> KeyManager<S, R> {
    pub fn new(store: S, relay: R, config: ClientConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            relay,
            config,
            clock,
            local: OnceCell::new(),
            phase: Mutex::new(KeyState::Uninitialized),
            registration_gate: tokio::sync::Mutex::new(()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_system_clock(store: S, relay: R, config: ClientConfig) -> Self {
        Self::new(store, relay, config, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn state(&self) -> KeyState {
        *locked(&self.phase)
    }

    fn set_state(&self, state: KeyState) {
        *locked(&self.phase) = state;
    }

    // ── Local key pair ──────────────────────────────────────────────────────

    /// Load or create the key pair, then run a registration pass.
    ///
    /// Concurrent callers share one load-or-generate; a failed attempt leaves
    /// the cell empty so the next caller retries. Registration failures are
    /// reported in the returned status, never as an error.
    pub async fn initialize(&self) -> Result<RegistrationStatus, E2eeError> {
        self.local.get_or_try_init(|| self.load_or_generate()).await?;
        self.attempt_registration().await
    }

    pub fn local_keys(&self) -> Result<&LocalKeys, E2eeError> {
        self.local.get().ok_or(E2eeError::KeyNotInitialized)
    }

    /// `senderKeyId` for envelopes built on this device.
    pub fn sender_key_id(&self) -> Result<String, E2eeError> {
        Ok(self.local_keys()?.fingerprint())
    }

    async fn load_or_generate(&self) -> Result<LocalKeys, E2eeError> {
        let mut state = store::load_state(&self.store).await?;

        if let Some(record) = state.key_pair.clone() {
            let keys = tokio::task::spawn_blocking(move || keys::unlock_record(&record))
                .await
                .map_err(|e| E2eeError::KeyGenerationFailed(e.to_string()))?
                .map_err(|e| {
                    E2eeError::KeyGenerationFailed(format!("stored key pair could not be opened: {e}"))
                })?;
            info!("[keys] loaded key pair {}", keys.key_id);
            self.set_state(if state.registration.pending {
                KeyState::PendingRetry
            } else {
                KeyState::Registered
            });
            return Ok(keys);
        }

        let now = self.clock.now_millis();
        let (record, keys) = tokio::task::spawn_blocking(move || keys::generate_record(now))
            .await
            .map_err(|e| E2eeError::KeyGenerationFailed(e.to_string()))?
            .map_err(|e| E2eeError::KeyGenerationFailed(e.to_string()))?;

        // Fresh keys are due for registration straight away.
        state.key_pair = Some(record);
        state.registration = RegistrationRetryState { pending: true, last_attempt_at: 0, failure_count: 0 };
        store::save_state(&self.store, &state).await?;

        info!("[keys] generated key pair {}", keys.key_id);
        self.set_state(KeyState::KeysGenerated);
        Ok(keys)
    }

    // ── Registration ────────────────────────────────────────────────────────

    /// Background registration pass. A no-op until the backoff window for the
    /// current failure count has elapsed.
    pub async fn attempt_registration(&self) -> Result<RegistrationStatus, E2eeError> {
        let keys = self.local_keys()?;
        let _gate = self.registration_gate.lock().await;

        let mut state = store::load_state(&self.store).await?;
        if !state.registration.pending {
            self.set_state(KeyState::Registered);
            return Ok(RegistrationStatus::Registered);
        }

        let retry_at = next_attempt_at(&state.registration);
        if self.clock.now_millis() < retry_at {
            debug!("[keys] registration deferred until {retry_at}");
            return Ok(RegistrationStatus::Deferred { retry_at });
        }

        match self.register_once(keys, &mut state).await? {
            Ok(()) => Ok(RegistrationStatus::Registered),
            Err(_) => Ok(RegistrationStatus::Pending {
                failure_count: state.registration.failure_count,
                retry_at: next_attempt_at(&state.registration),
            }),
        }
    }

    /// User-triggered registration: ignores the backoff window and reports
    /// transport failures to the caller.
    pub async fn force_register(&self) -> Result<(), E2eeError> {
        let keys = self.local_keys()?;
        let _gate = self.registration_gate.lock().await;

        let mut state = store::load_state(&self.store).await?;
        if state.key_pair.is_none() {
            return Err(E2eeError::KeyNotInitialized);
        }
        self.register_once(keys, &mut state).await?.map_err(E2eeError::from)
    }

    /// One registration request plus the persisted bookkeeping around it.
    /// The outer `Result` is storage, the inner one the relay's answer.
    async fn register_once(
        &self,
        keys: &LocalKeys,
        state: &mut PersistedE2eeState,
    ) -> Result<Result<(), NetworkError>, E2eeError> {
        let request = RegisterRequest {
            user_id: self.config.user_id.clone(),
            vault_id: self.config.vault_id.clone(),
            public_key: keys.public_key_pem.clone(),
            key_id: keys.key_id.clone(),
        };
        let outcome = self.relay.register_public_key(&request).await;
        let now = self.clock.now_millis();

        match &outcome {
            Ok(()) => {
                state.registration = RegistrationRetryState::default();
                info!("[keys] public key {} registered for {}", keys.key_id, self.config.user_id);
                self.set_state(KeyState::Registered);
            }
            Err(e) => {
                let retry = &mut state.registration;
                retry.pending = true;
                retry.failure_count = retry.failure_count.saturating_add(1);
                retry.last_attempt_at = now;
                warn!(
                    "[keys] registration failed ({} in a row), next try in {}h: {e}",
                    retry.failure_count,
                    backoff_wait_hours(retry.failure_count)
                );
                self.set_state(KeyState::PendingRetry);
            }
        }
        store::save_state(&self.store, state).await?;
        Ok(outcome)
    }

    pub async fn retry_state(&self) -> Result<RegistrationRetryState, E2eeError> {
        Ok(store::load_state(&self.store).await?.registration)
    }

    // ── Public-key cache ────────────────────────────────────────────────────

    /// Recipient public key, from cache when younger than 24 h.
    pub async fn get_public_key(&self, user_id: &str) -> Result<RsaPublicKey, E2eeError> {
        Ok(self.get_public_key_entry(user_id).await?.1)
    }

    /// Like [`Self::get_public_key`], also returning the directory entry.
    pub async fn get_public_key_entry(
        &self,
        user_id: &str,
    ) -> Result<(PublicKeyCacheEntry, RsaPublicKey), E2eeError> {
        let now = self.clock.now_millis();
        let cached = locked(&self.cache)
            .get(user_id)
            .filter(|e| now - e.fetched_at < PUBLIC_KEY_TTL_MS)
            .cloned();
        if let Some(entry) = cached {
            debug!("[keys] public key cache hit for {user_id}");
            let key = crypto::import_public_pem(&entry.public_key_pem).map_err(|e| {
                E2eeError::PublicKeyFetchFailed { user_id: user_id.to_string(), reason: e.to_string() }
            })?;
            return Ok((entry, key));
        }

        debug!("[keys] fetching public key for {user_id}");
        let resp = self
            .relay
            .fetch_public_key(user_id, &self.config.vault_id)
            .await
            .map_err(|e| match e {
                NetworkError::NotFound => E2eeError::KeyNotFound { user_id: user_id.to_string() },
                other => E2eeError::PublicKeyFetchFailed {
                    user_id: user_id.to_string(),
                    reason: other.to_string(),
                },
            })?;

        let key = crypto::import_public_pem(&resp.public_key).map_err(|e| {
            E2eeError::PublicKeyFetchFailed { user_id: user_id.to_string(), reason: e.to_string() }
        })?;
        let entry = PublicKeyCacheEntry {
            user_id: user_id.to_string(),
            public_key_pem: resp.public_key,
            key_id: resp.key_id,
            fetched_at: now,
        };
        locked(&self.cache).insert(user_id.to_string(), entry.clone());
        Ok((entry, key))
    }

    pub fn clear_cache_for_user(&self, user_id: &str) {
        locked(&self.cache).remove(user_id);
    }

    pub fn clear_public_key_cache(&self) {
        locked(&self.cache).clear();
    }

    pub fn cached_public_key(&self, user_id: &str) -> Option<PublicKeyCacheEntry> {
        locked(&self.cache).get(user_id).cloned()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySettingsStore;
    use crate::testing::{test_config, test_public_pem, ManualClock, MockRelay};

    type Manager = KeyManager<Arc<MemorySettingsStore>, Arc<MockRelay>>;

    fn manager(store: &Arc<MemorySettingsStore>, relay: &Arc<MockRelay>, clock: &Arc<ManualClock>) -> Manager {
        KeyManager::new(store.clone(), relay.clone(), test_config(), clock.clone())
    }

    fn setup() -> (Arc<MemorySettingsStore>, Arc<MockRelay>, Arc<ManualClock>) {
        (
            Arc::new(MemorySettingsStore::new()),
            Arc::new(MockRelay::new()),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let hours: Vec<i64> = (0..=6).map(backoff_wait_hours).collect();
        assert_eq!(hours, [1, 2, 4, 8, 16, 24, 24]);
        assert_eq!(backoff_wait_hours(200), 24);
    }

    #[test]
    fn next_attempt_is_immediate_without_failures_and_never_overflows() {
        let fresh = RegistrationRetryState { pending: true, last_attempt_at: 0, failure_count: 0 };
        assert_eq!(next_attempt_at(&fresh), 0);

        let corrupt = RegistrationRetryState { pending: true, last_attempt_at: i64::MAX, failure_count: 3 };
        assert_eq!(next_attempt_at(&corrupt), i64::MAX);
    }

    #[tokio::test]
    async fn fresh_keys_register_even_near_the_epoch() {
        let store = Arc::new(MemorySettingsStore::new());
        let relay = Arc::new(MockRelay::new());
        let clock = Arc::new(ManualClock::new(0));
        let km = manager(&store, &relay, &clock);

        assert_eq!(km.initialize().await.unwrap(), RegistrationStatus::Registered);
        assert_eq!(relay.register_calls(), 1);
        assert_eq!(km.state(), KeyState::Registered);
    }

    #[tokio::test]
    async fn first_initialize_generates_persists_and_registers() {
        let (store, relay, clock) = setup();
        let km = manager(&store, &relay, &clock);
        assert_eq!(km.state(), KeyState::Uninitialized);

        assert_eq!(km.initialize().await.unwrap(), RegistrationStatus::Registered);
        assert_eq!(km.state(), KeyState::Registered);
        assert_eq!(relay.register_calls(), 1);

        let keys = km.local_keys().unwrap();
        let registered = relay.registered("U-self").unwrap();
        assert_eq!(registered.public_key, keys.public_key_pem);
        assert_eq!(registered.vault_id, "vault-1");

        let state = store::load_state(store.as_ref()).await.unwrap();
        assert!(!state.registration.pending);
        assert_eq!(state.key_pair.unwrap().key_id, keys.key_id);
    }

    #[tokio::test]
    async fn reinitialize_loads_same_key_pair() {
        let (store, relay, clock) = setup();
        let first = manager(&store, &relay, &clock);
        first.initialize().await.unwrap();
        let fp = first.sender_key_id().unwrap();

        let second = manager(&store, &relay, &clock);
        second.initialize().await.unwrap();
        assert_eq!(second.sender_key_id().unwrap(), fp);
        // Already registered; loading does not re-register.
        assert_eq!(relay.register_calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_initialize_is_single_flight() {
        let (store, relay, clock) = setup();
        let km = manager(&store, &relay, &clock);

        let (a, b, c) = tokio::join!(km.initialize(), km.initialize(), km.initialize());
        for status in [a, b, c] {
            assert_eq!(status.unwrap(), RegistrationStatus::Registered);
        }
        assert_eq!(relay.register_calls(), 1);
        let stored = store::load_state(store.as_ref()).await.unwrap().key_pair.unwrap();
        assert_eq!(stored.key_id, km.local_keys().unwrap().key_id);
    }

    #[tokio::test]
    async fn local_keys_before_initialize_is_an_error() {
        let (store, relay, clock) = setup();
        let km = manager(&store, &relay, &clock);
        assert!(matches!(km.local_keys(), Err(E2eeError::KeyNotInitialized)));
        assert!(matches!(km.attempt_registration().await, Err(E2eeError::KeyNotInitialized)));
    }

    #[tokio::test]
    async fn failed_registration_does_not_fail_initialize() {
        let (store, relay, clock) = setup();
        relay.fail_registrations(true);
        let km = manager(&store, &relay, &clock);

        let status = km.initialize().await.unwrap();
        assert_eq!(
            status,
            RegistrationStatus::Pending { failure_count: 1, retry_at: clock.now_millis() + 2 * HOUR_MS }
        );
        assert_eq!(km.state(), KeyState::PendingRetry);
        assert!(km.local_keys().is_ok());
    }

    #[tokio::test]
    async fn backoff_gates_registration_attempts() {
        let (store, relay, clock) = setup();
        relay.fail_registrations(true);
        let km = manager(&store, &relay, &clock);
        km.initialize().await.unwrap();
        assert_eq!(relay.register_calls(), 1);

        // failure_count = 1 → wait 2h
        clock.advance_hours(1);
        assert!(matches!(
            km.attempt_registration().await.unwrap(),
            RegistrationStatus::Deferred { .. }
        ));
        assert_eq!(relay.register_calls(), 1);

        clock.advance_hours(1);
        assert!(matches!(
            km.attempt_registration().await.unwrap(),
            RegistrationStatus::Pending { failure_count: 2, .. }
        ));
        assert_eq!(relay.register_calls(), 2);

        // failure_count = 2 → wait 4h
        clock.advance_hours(3);
        km.attempt_registration().await.unwrap();
        assert_eq!(relay.register_calls(), 2);

        relay.fail_registrations(false);
        clock.advance_hours(1);
        assert_eq!(km.attempt_registration().await.unwrap(), RegistrationStatus::Registered);
        assert_eq!(relay.register_calls(), 3);
        assert_eq!(km.retry_state().await.unwrap(), RegistrationRetryState::default());
        assert_eq!(km.state(), KeyState::Registered);
    }

    #[tokio::test]
    async fn wait_never_exceeds_a_day() {
        let (store, relay, clock) = setup();
        relay.fail_registrations(true);
        let km = manager(&store, &relay, &clock);
        km.initialize().await.unwrap();

        for _ in 0..8 {
            clock.advance_hours(24);
            km.attempt_registration().await.unwrap();
        }
        let retry = km.retry_state().await.unwrap();
        assert_eq!(retry.failure_count, 9);
        assert_eq!(next_attempt_at(&retry) - retry.last_attempt_at, 24 * HOUR_MS);
    }

    #[tokio::test]
    async fn pending_registration_retried_on_next_start() {
        let (store, relay, clock) = setup();
        relay.fail_registrations(true);
        manager(&store, &relay, &clock).initialize().await.unwrap();

        relay.fail_registrations(false);
        clock.advance_hours(2);
        let restarted = manager(&store, &relay, &clock);
        assert_eq!(restarted.initialize().await.unwrap(), RegistrationStatus::Registered);
        assert_eq!(relay.register_calls(), 2);
    }

    #[tokio::test]
    async fn force_register_bypasses_backoff_and_reports_errors() {
        let (store, relay, clock) = setup();
        relay.fail_registrations(true);
        let km = manager(&store, &relay, &clock);
        km.initialize().await.unwrap();

        let err = km.force_register().await.unwrap_err();
        assert!(matches!(err, E2eeError::NetworkError(_)));
        assert_eq!(relay.register_calls(), 2);
        assert_eq!(km.retry_state().await.unwrap().failure_count, 2);

        relay.fail_registrations(false);
        km.force_register().await.unwrap();
        assert_eq!(km.state(), KeyState::Registered);
    }

    #[tokio::test]
    async fn public_key_cache_respects_ttl() {
        let (store, relay, clock) = setup();
        relay.put_key("U-peer", &test_public_pem(), "k-peer");
        let km = manager(&store, &relay, &clock);

        km.get_public_key("U-peer").await.unwrap();
        assert_eq!(relay.fetch_calls(), 1);

        clock.advance_hours(23);
        km.get_public_key("U-peer").await.unwrap();
        assert_eq!(relay.fetch_calls(), 1);

        clock.advance_hours(1);
        km.get_public_key("U-peer").await.unwrap();
        assert_eq!(relay.fetch_calls(), 2);

        km.get_public_key("U-peer").await.unwrap();
        assert_eq!(relay.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn clearing_cache_forces_refetch() {
        let (store, relay, clock) = setup();
        relay.put_key("U-peer", &test_public_pem(), "k-peer");
        let km = manager(&store, &relay, &clock);

        km.get_public_key("U-peer").await.unwrap();
        assert_eq!(km.cached_public_key("U-peer").unwrap().key_id, "k-peer");
        km.clear_cache_for_user("U-peer");
        km.get_public_key("U-peer").await.unwrap();
        km.clear_public_key_cache();
        assert!(km.cached_public_key("U-peer").is_none());
        km.get_public_key("U-peer").await.unwrap();
        assert_eq!(relay.fetch_calls(), 3);
    }

    #[tokio::test]
    async fn unknown_recipient_is_key_not_found() {
        let (store, relay, clock) = setup();
        let km = manager(&store, &relay, &clock);
        assert!(matches!(
            km.get_public_key("U-nobody").await,
            Err(E2eeError::KeyNotFound { user_id }) if user_id == "U-nobody"
        ));
        assert!(km.cached_public_key("U-nobody").is_none());
    }

    #[tokio::test]
    async fn relay_failure_is_fetch_failed_and_bad_pem_not_cached() {
        let (store, relay, clock) = setup();
        relay.put_key("U-bad", "not a pem", "k");
        let km = manager(&store, &relay, &clock);
        assert!(matches!(
            km.get_public_key("U-bad").await,
            Err(E2eeError::PublicKeyFetchFailed { .. })
        ));
        assert!(km.cached_public_key("U-bad").is_none());

        relay.fail_fetches(true);
        assert!(matches!(
            km.get_public_key("U-bad").await,
            Err(E2eeError::PublicKeyFetchFailed { .. })
        ));
    }
}
