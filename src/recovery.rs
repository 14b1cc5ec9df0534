//! Error classification and recovery.
//!
//! Every [`E2eeError`] kind maps to exactly one policy: re-initialize, retry
//! the key lookup a bounded number of times, substitute a placeholder, or
//! surface a notice and propagate.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, warn};
use rsa::RsaPublicKey;

use crate::clock::HOUR_MS;
use crate::error::{E2eeError, ErrorKind};
use crate::key_manager::{locked, KeyManager, RegistrationStatus};
use crate::network::RelayClient;
use crate::store::SettingsStore;

/// Shown in place of a message body that could not be decrypted.
pub const DECRYPTION_PLACEHOLDER: &str = "[Message could not be loaded]";

/// Attempts spent on a recipient key that the relay reports as missing.
pub const KEY_NOT_FOUND_ATTEMPTS: u32 = 3;

const DECRYPTION_NOTICE_INTERVAL_MS: i64 = HOUR_MS;

// ─── Notices ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    /// Key setup failed; settings probably need checking.
    ConnectionProblem,
    NetworkProblem,
    /// Some messages could not be decrypted.
    DecryptionProblem,
    /// Public key not yet registered; retried in the background.
    RegistrationPending,
    UnexpectedError,
}

impl Notice {
    pub fn message(self) -> &'static str {
        match self {
            Notice::ConnectionProblem => "Connection error. Please check your settings.",
            Notice::NetworkProblem => "Network error. Please check your internet connection.",
            Notice::DecryptionProblem => "Some messages could not be decrypted.",
            Notice::RegistrationPending => {
                "Encryption key registration is pending and will be retried automatically."
            }
            Notice::UnexpectedError => "An error occurred while processing messages.",
        }
    }
}

/// Host-provided sink for user-visible notices.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Default notifier: notices only go to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        warn!("[notice] {}", notice.message());
    }
}

// ─── Bounded retry ───────────────────────────────────────────────────────────

/// Run `op` until it succeeds or `budget` attempts have been spent, sleeping
/// `delay` between attempts. `op` receives the 1-based attempt number. The
/// last error is returned when the budget runs out.
pub async fn retry_bounded<T, E, F, Fut>(budget: u32, delay: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let budget = budget.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= budget => return Err(e),
            Err(_) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

// ─── ErrorHandler ────────────────────────────────────────────────────────────

/// What a successful recovery produced.
#[derive(Debug)]
pub enum Recovered {
    Reinitialized(RegistrationStatus),
    PublicKey(RsaPublicKey),
    Placeholder(String),
}

pub struct ErrorHandler<S, R> {
    keys: Arc<KeyManager<S, R>>,
    notifier: Arc<dyn Notifier>,
    /// Advisory: user id → ms timestamp of the last failed lookup.
    unreachable: Mutex<HashMap<String, i64>>,
    last_decryption_notice: Mutex<Option<i64>>,
    registration_notice_shown: AtomicBool,
}

impl<S: SettingsStore, R: RelayClient> ErrorHandler<S, R> {
    pub fn new(keys: Arc<KeyManager<S, R>>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            keys,
            notifier,
            unreachable: Mutex::new(HashMap::new()),
            last_decryption_notice: Mutex::new(None),
            registration_notice_shown: AtomicBool::new(false),
        }
    }

    pub fn keys(&self) -> &Arc<KeyManager<S, R>> {
        &self.keys
    }

    /// Dispatch on the error kind. `Ok` means the error was absorbed.
    pub async fn handle(&self, err: E2eeError, context: &str) -> Result<Recovered, E2eeError> {
        match err.kind() {
            ErrorKind::KeyNotInitialized => {
                self.recover_key_not_initialized().await.map(Recovered::Reinitialized)
            }
            ErrorKind::KeyNotFound => match err {
                E2eeError::KeyNotFound { user_id } => {
                    self.recover_key_not_found(&user_id).await.map(Recovered::PublicKey)
                }
                other => Err(other),
            },
            ErrorKind::DecryptionFailed => Ok(Recovered::Placeholder(self.decryption_placeholder(&err))),
            ErrorKind::PublicKeyFetchFailed => {
                if let Some(user_id) = err.user_id() {
                    self.mark_unreachable(user_id);
                }
                Err(err)
            }
            ErrorKind::NetworkError => {
                self.notifier.notify(Notice::NetworkProblem);
                Err(err)
            }
            ErrorKind::EncryptionFailed | ErrorKind::KeyGenerationFailed => {
                error!("[e2ee] {context}: {err}");
                Err(err)
            }
            ErrorKind::StorageFailed => {
                error!("[e2ee] {context}: {err}");
                self.notifier.notify(Notice::UnexpectedError);
                Err(err)
            }
        }
    }

    /// Initialize keys, with the registration-pending notice shown at most
    /// once per process.
    pub async fn initialize_keys(&self) -> Result<RegistrationStatus, E2eeError> {
        let status = self.keys.initialize().await?;
        if matches!(status, RegistrationStatus::Pending { .. })
            && !self.registration_notice_shown.swap(true, Ordering::SeqCst)
        {
            self.notifier.notify(Notice::RegistrationPending);
        }
        Ok(status)
    }

    /// `KeyNotInitialized`: run `initialize()`; failure becomes `KeyGenerationFailed`.
    pub async fn recover_key_not_initialized(&self) -> Result<RegistrationStatus, E2eeError> {
        self.initialize_keys().await.map_err(|e| {
            error!("[e2ee] key initialization failed: {e}");
            self.notifier.notify(Notice::ConnectionProblem);
            match e {
                E2eeError::KeyGenerationFailed(_) => e,
                other => E2eeError::KeyGenerationFailed(other.to_string()),
            }
        })
    }

    /// `KeyNotFound`: drop the cached entry and refetch, up to
    /// [`KEY_NOT_FOUND_ATTEMPTS`] times, then give up with `PublicKeyFetchFailed`.
    pub async fn recover_key_not_found(&self, user_id: &str) -> Result<RsaPublicKey, E2eeError> {
        let keys = &self.keys;
        let outcome = retry_bounded(KEY_NOT_FOUND_ATTEMPTS, Duration::ZERO, |_| {
            keys.clear_cache_for_user(user_id);
            keys.get_public_key(user_id)
        })
        .await;

        match outcome {
            Ok(key) => {
                locked(&self.unreachable).remove(user_id);
                Ok(key)
            }
            Err(last) => {
                self.mark_unreachable(user_id);
                Err(E2eeError::PublicKeyFetchFailed {
                    user_id: user_id.to_string(),
                    reason: format!("gave up after {KEY_NOT_FOUND_ATTEMPTS} attempts: {last}"),
                })
            }
        }
    }

    /// Recipient key with the `KeyNotFound` and `PublicKeyFetchFailed`
    /// policies applied.
    pub async fn public_key_for(&self, user_id: &str) -> Result<RsaPublicKey, E2eeError> {
        match self.keys.get_public_key(user_id).await {
            Ok(key) => {
                locked(&self.unreachable).remove(user_id);
                Ok(key)
            }
            Err(E2eeError::KeyNotFound { .. }) => self.recover_key_not_found(user_id).await,
            Err(e) => {
                if e.kind() == ErrorKind::PublicKeyFetchFailed {
                    self.mark_unreachable(user_id);
                }
                Err(e)
            }
        }
    }

    /// `DecryptionFailed`: log, show the notice at most once an hour, and
    /// hand back the placeholder text.
    pub fn decryption_placeholder(&self, err: &E2eeError) -> String {
        warn!("[e2ee] decryption failed: {err}");
        let now = self.keys.clock().now_millis();
        let mut last = locked(&self.last_decryption_notice);
        let due = last.map_or(true, |at| now - at >= DECRYPTION_NOTICE_INTERVAL_MS);
        if due {
            *last = Some(now);
            drop(last);
            self.notifier.notify(Notice::DecryptionProblem);
        }
        DECRYPTION_PLACEHOLDER.to_string()
    }

    // ── Unreachable users ───────────────────────────────────────────────────

    pub fn mark_unreachable(&self, user_id: &str) {
        let now = self.keys.clock().now_millis();
        warn!("[e2ee] marking {user_id} unreachable");
        locked(&self.unreachable).insert(user_id.to_string(), now);
    }

    pub fn is_unreachable(&self, user_id: &str) -> bool {
        locked(&self.unreachable).contains_key(user_id)
    }

    pub fn unreachable_users(&self) -> HashMap<String, i64> {
        locked(&self.unreachable).clone()
    }

    pub fn clear_unreachable(&self) {
        locked(&self.unreachable).clear();
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
