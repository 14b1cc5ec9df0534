//! Client-side persistence: the injected key-value [`SettingsStore`] and the
//! versioned [`PersistedE2eeState`] record kept inside it.
//!
//! Hosts hand the crate whatever durable storage they have (a plugin data
//! file, SQLite, ...). The crate only ever reads and writes whole JSON
//! documents under a handful of keys.

use std::collections::HashMap;
use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::{ClientConfig, DEFAULT_API_URL};
use crate::keys::KeyPairRecord;

// ─── Keys & versions ─────────────────────────────────────────────────────────

pub const STATE_KEY: &str       = "e2ee.state";
pub const CONFIG_KEY: &str      = "e2ee.config";
/// Loosely typed blob written by older installs. The host owns it; it is
/// read during migration and never rewritten.
pub const LEGACY_DATA_KEY: &str = "plugin.data";

pub const STATE_VERSION: u32 = 2;

// ─── Error ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("settings backend error: {0}")]
    Backend(String),
    #[error("stored settings are corrupt: {0}")]
    Corrupt(String),
    #[error("settings version {0} is newer than this build understands")]
    UnsupportedVersion(u32),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

// ─── SettingsStore ───────────────────────────────────────────────────────────

/// Durable string-keyed storage supplied by the host.
pub trait SettingsStore: Send + Sync {
    fn load(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;
    fn save(&self, key: &str, value: &str) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// In-memory store for hosts without durable storage, and for tests.
#[derive(Debug, Default)]
pub struct MemorySettingsStore(RwLock<HashMap<String, String>>);

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    async fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.0.read().await.get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.0.write().await.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

impl<T: SettingsStore> SettingsStore for std::sync::Arc<T> {
    fn load(&self, key: &str) -> impl Future<Output = Result<Option<String>, StoreError>> + Send {
        (**self).load(key)
    }

    fn save(&self, key: &str, value: &str) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).save(key, value)
    }
}

// ─── Persisted records ───────────────────────────────────────────────────────

/// Background registration bookkeeping. `pending` stays true until the relay
/// accepts the public key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRetryState {
    pub pending: bool,
    pub last_attempt_at: i64,
    pub failure_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedE2eeState {
    pub version: u32,
    pub key_pair: Option<KeyPairRecord>,
    #[serde(default)]
    pub registration: RegistrationRetryState,
}

impl Default for PersistedE2eeState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            key_pair: None,
            registration: RegistrationRetryState::default(),
        }
    }
}

/// Shape of the old unversioned blob. Only the fields this crate owns.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyPluginData {
    encryption_keys: Option<KeyPairRecord>,
    #[serde(default)]
    pending_key_registration: bool,
    api_url: Option<String>,
    line_user_id: Option<String>,
    vault_id: Option<String>,
}

/// Bring any known on-disk shape up to the current version.
pub fn migrate_state(raw: Value) -> Result<PersistedE2eeState, StoreError> {
    match raw.get("version").and_then(Value::as_u64) {
        Some(v) if v == STATE_VERSION as u64 => Ok(serde_json::from_value(raw)?),
        Some(v) if v > STATE_VERSION as u64 => Err(StoreError::UnsupportedVersion(v as u32)),
        _ => {
            let legacy: LegacyPluginData = serde_json::from_value(raw)?;
            // A legacy pending flag carries no timing; retry on the next pass.
            let registration = RegistrationRetryState {
                pending: legacy.pending_key_registration,
                last_attempt_at: 0,
                failure_count: 0,
            };
            Ok(PersistedE2eeState {
                version: STATE_VERSION,
                key_pair: legacy.encryption_keys,
                registration,
            })
        }
    }
}

/// Load the current state, migrating the legacy blob on first contact.
pub async fn load_state<S: SettingsStore>(store: &S) -> Result<PersistedE2eeState, StoreError> {
    if let Some(text) = store.load(STATE_KEY).await? {
        let raw: Value = serde_json::from_str(&text)?;
        return migrate_state(raw);
    }

    let Some(text) = store.load(LEGACY_DATA_KEY).await? else {
        return Ok(PersistedE2eeState::default());
    };
    let state = migrate_state(serde_json::from_str(&text)?)?;
    if state.key_pair.is_some() || state.registration.pending {
        log::info!("[store] migrated legacy key settings to version {STATE_VERSION}");
        save_state(store, &state).await?;
    }
    Ok(state)
}

pub async fn save_state<S: SettingsStore>(
    store: &S,
    state: &PersistedE2eeState,
) -> Result<(), StoreError> {
    let text = serde_json::to_string(state)?;
    store.save(STATE_KEY, &text).await
}

/// Client config from `e2ee.config`, falling back to the fields the legacy
/// blob kept at its top level.
pub async fn load_client_config<S: SettingsStore>(
    store: &S,
) -> Result<Option<ClientConfig>, StoreError> {
    if let Some(text) = store.load(CONFIG_KEY).await? {
        return Ok(Some(serde_json::from_str(&text)?));
    }
    let Some(text) = store.load(LEGACY_DATA_KEY).await? else {
        return Ok(None);
    };
    let legacy: LegacyPluginData = serde_json::from_str(&text)?;
    Ok(match (legacy.line_user_id, legacy.vault_id) {
        (Some(user_id), Some(vault_id)) => Some(
            ClientConfig::new(user_id, vault_id)
                .with_api_url(legacy.api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string())),
        ),
        _ => None,
    })
}

pub async fn save_client_config<S: SettingsStore>(
    store: &S,
    config: &ClientConfig,
) -> Result<(), StoreError> {
    store.save(CONFIG_KEY, &serde_json::to_string(config)?).await
}
