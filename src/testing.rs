//! Test fixtures shared across modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::Value;

use crate::clock::{Clock, HOUR_MS};
use crate::config::ClientConfig;
use crate::crypto;
use crate::network::{NetworkError, PublicKeyResponse, RegisterRequest, RelayClient, SyncStatusUpdate};
use crate::recovery::{Notice, Notifier};

// ─── Keys ────────────────────────────────────────────────────────────────────

static KEY_A: OnceLock<(RsaPrivateKey, RsaPublicKey)> = OnceLock::new();
static KEY_B: OnceLock<(RsaPrivateKey, RsaPublicKey)> = OnceLock::new();

/// RSA generation is slow; every test shares these two pairs.
pub fn test_key_pair() -> (&'static RsaPrivateKey, &'static RsaPublicKey) {
    let (private, public) = KEY_A.get_or_init(|| crypto::generate_key_pair().unwrap());
    (private, public)
}

pub fn other_key_pair() -> (&'static RsaPrivateKey, &'static RsaPublicKey) {
    let (private, public) = KEY_B.get_or_init(|| crypto::generate_key_pair().unwrap());
    (private, public)
}

pub fn test_public_pem() -> String {
    crypto::export_public_pem(test_key_pair().1).unwrap()
}

pub fn test_config() -> ClientConfig {
    ClientConfig::new("U-self", "vault-1")
}

// ─── Clock ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self(AtomicI64::new(start_ms))
    }

    pub fn advance_ms(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn advance_hours(&self, hours: i64) {
        self.advance_ms(hours * HOUR_MS);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ─── Relay ───────────────────────────────────────────────────────────────────

/// In-memory relay with switchable failures and call counters.
#[derive(Default)]
pub struct MockRelay {
    keys: Mutex<HashMap<String, PublicKeyResponse>>,
    registrations: Mutex<HashMap<String, RegisterRequest>>,
    messages: Mutex<Vec<Value>>,
    synced: Mutex<Vec<String>>,
    fail_register: AtomicBool,
    fail_fetch: AtomicBool,
    register_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_key(&self, user_id: &str, pem: &str, key_id: &str) {
        self.keys.lock().unwrap().insert(
            user_id.to_string(),
            PublicKeyResponse {
                user_id: user_id.to_string(),
                public_key: pem.to_string(),
                key_id: key_id.to_string(),
                registered_at: 0,
            },
        );
    }

    pub fn push_message(&self, record: Value) {
        self.messages.lock().unwrap().push(record);
    }

    pub fn fail_registrations(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn registered(&self, user_id: &str) -> Option<RegisterRequest> {
        self.registrations.lock().unwrap().get(user_id).cloned()
    }

    pub fn synced_ids(&self) -> Vec<String> {
        self.synced.lock().unwrap().clone()
    }
}

impl RelayClient for MockRelay {
    async fn register_public_key(&self, request: &RegisterRequest) -> Result<(), NetworkError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(NetworkError::Transport("connection refused".into()));
        }
        self.registrations
            .lock()
            .unwrap()
            .insert(request.user_id.clone(), request.clone());
        self.put_key(&request.user_id, &request.public_key, &request.key_id);
        Ok(())
    }

    async fn fetch_public_key(
        &self,
        user_id: &str,
        _vault_id: &str,
    ) -> Result<PublicKeyResponse, NetworkError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(NetworkError::Status { status: 500, body: "boom".into() });
        }
        self.keys
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .ok_or(NetworkError::NotFound)
    }

    async fn fetch_messages(&self, _vault_id: &str, _user_id: &str) -> Result<Vec<Value>, NetworkError> {
        Ok(self.messages.lock().unwrap().clone())
    }

    async fn mark_synced(&self, update: &SyncStatusUpdate) -> Result<u64, NetworkError> {
        self.synced.lock().unwrap().extend(update.message_ids.iter().cloned());
        Ok(update.message_ids.len() as u64)
    }
}

// ─── Notifier ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct RecordingNotifier(Mutex<Vec<Notice>>);

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.0.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.0.lock().unwrap().push(notice);
    }
}
