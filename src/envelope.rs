//! Hybrid envelope for message bodies.
//!
//! # How it works
//!
//! 1. Draw a fresh 256-bit AES key.
//! 2. Encrypt:  AES-256-GCM(plaintext) under a fresh 96-bit nonce.
//! 3. Wrap the AES key with RSA-OAEP(SHA-256) for the recipient.
//! 4. Envelope: base64 fields `encryptedContent`, `encryptedAESKey`, `iv`
//!    plus `senderKeyId`, `recipientUserId`, `timestamp`, `version`.
//!
//! The relay only ever stores the envelope. Records written before a user
//! opted in still carry a bare `text` field and are passed through.

use std::sync::Arc;

use log::{debug, warn};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::{self, CryptoError};
use crate::error::E2eeError;
use crate::key_manager::KeyManager;
use crate::network::RelayClient;
use crate::recovery::ErrorHandler;
use crate::store::SettingsStore;

// ─── Constants ────────────────────────────────────────────────────────────────

pub const ENVELOPE_VERSION: &str = "1.0";

const WRAPPED_KEY_FIELDS: [&str; 3] = ["encryptedAESKey", "encryptedAesKey", "encryptedSymmetricKey"];

// ─── Wire format ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub encrypted_content: String,
    #[serde(rename = "encryptedAESKey", alias = "encryptedAesKey", alias = "encryptedSymmetricKey")]
    pub encrypted_symmetric_key: String,
    pub iv: String,
    pub sender_key_id: String,
    pub recipient_user_id: String,
    pub timestamp: i64,
    pub version: String,
}

impl EncryptedEnvelope {
    /// Envelope fields merged into an object, with `encrypted: true`.
    pub fn into_record_fields(self) -> Map<String, Value> {
        let mut fields = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        fields.insert("encrypted".into(), Value::Bool(true));
        fields
    }
}

/// A stored record, decoded once at the storage boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredRecord {
    Encrypted(EncryptedEnvelope),
    Legacy(String),
    Unknown(Value),
}

fn str_field<'a>(obj: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    obj.get(name).and_then(Value::as_str)
}

impl StoredRecord {
    /// Structural classification.
    ///
    /// * `Encrypted` iff `encryptedContent`, the wrapped key, `iv` and
    ///   `version` are all strings.
    /// * `Legacy` iff `text` is a string and no encrypted field is present
    ///   (a bare JSON string counts as legacy text).
    /// * `Unknown` otherwise.
    pub fn classify(record: Value) -> StoredRecord {
        let obj = match record {
            Value::String(text) => return StoredRecord::Legacy(text),
            Value::Object(obj) => obj,
            other => return StoredRecord::Unknown(other),
        };

        let content = str_field(&obj, "encryptedContent");
        let wrapped = WRAPPED_KEY_FIELDS.iter().find_map(|f| str_field(&obj, f));
        let iv      = str_field(&obj, "iv");
        let version = str_field(&obj, "version");

        if let (Some(content), Some(wrapped), Some(iv), Some(version)) = (content, wrapped, iv, version) {
            return StoredRecord::Encrypted(EncryptedEnvelope {
                encrypted_content: content.to_string(),
                encrypted_symmetric_key: wrapped.to_string(),
                iv: iv.to_string(),
                sender_key_id: str_field(&obj, "senderKeyId").unwrap_or_default().to_string(),
                recipient_user_id: str_field(&obj, "recipientUserId").unwrap_or_default().to_string(),
                timestamp: obj.get("timestamp").and_then(Value::as_i64).unwrap_or_default(),
                version: version.to_string(),
            });
        }

        let has_encrypted_field = ["encryptedContent", "iv"]
            .iter()
            .chain(WRAPPED_KEY_FIELDS.iter())
            .any(|f| obj.contains_key(*f));
        match str_field(&obj, "text") {
            Some(text) if !has_encrypted_field => StoredRecord::Legacy(text.to_string()),
            _ => StoredRecord::Unknown(Value::Object(obj)),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, StoredRecord::Encrypted(_))
    }
}

// ─── Key-in-hand primitives ───────────────────────────────────────────────────

/// Build an envelope for `recipient_key`. Shared by the client codec and the
/// relay mirror.
pub fn seal_with_key(
    plaintext: &str,
    recipient_key: &RsaPublicKey,
    recipient_user_id: &str,
    sender_key_id: &str,
    timestamp: i64,
) -> Result<EncryptedEnvelope, CryptoError> {
    let sym_key          = crypto::generate_symmetric_key();
    let (ciphertext, iv) = crypto::encrypt_aead(plaintext.as_bytes(), &sym_key)?;
    let wrapped          = crypto::wrap_key(&sym_key, recipient_key)?;

    Ok(EncryptedEnvelope {
        encrypted_content: crypto::encode_base64(&ciphertext),
        encrypted_symmetric_key: crypto::encode_base64(&wrapped),
        iv: crypto::encode_base64(&iv),
        sender_key_id: sender_key_id.to_string(),
        recipient_user_id: recipient_user_id.to_string(),
        timestamp,
        version: ENVELOPE_VERSION.to_string(),
    })
}

/// Recover the plaintext with the recipient's private key.
pub fn open_with_key(envelope: &EncryptedEnvelope, own: &RsaPrivateKey) -> Result<String, CryptoError> {
    let ciphertext = crypto::decode_base64(&envelope.encrypted_content)?;
    let wrapped    = crypto::decode_base64(&envelope.encrypted_symmetric_key)?;
    let iv         = crypto::decode_base64(&envelope.iv)?;

    let sym_key   = crypto::unwrap_key(&wrapped, own)?;
    let plaintext = crypto::decrypt_aead(&ciphertext, &sym_key, &iv)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
}

// ─── Codec ────────────────────────────────────────────────────────────────────

/// Client-side codec bound to one key manager and its recovery policy.
pub struct EnvelopeCodec<S, R> {
    keys: Arc<KeyManager<S, R>>,
    recovery: Arc<ErrorHandler<S, R>>,
}

impl<S: SettingsStore, R: RelayClient> EnvelopeCodec<S, R> {
    pub fn new(recovery: Arc<ErrorHandler<S, R>>) -> Self {
        Self { keys: recovery.keys().clone(), recovery }
    }

    pub fn recovery(&self) -> &Arc<ErrorHandler<S, R>> {
        &self.recovery
    }

    /// Our own `senderKeyId`, re-initializing the key manager once if needed.
    async fn sender_key_id(&self) -> Result<String, E2eeError> {
        match self.keys.sender_key_id() {
            Err(E2eeError::KeyNotInitialized) => {
                self.recovery.recover_key_not_initialized().await?;
                self.keys.sender_key_id()
            }
            other => other,
        }
    }

    pub async fn encrypt_for_recipient(
        &self,
        plaintext: &str,
        recipient_user_id: &str,
    ) -> Result<EncryptedEnvelope, E2eeError> {
        let mut batch = self.encrypt_batch(&[plaintext], recipient_user_id).await?;
        batch
            .pop()
            .ok_or_else(|| E2eeError::encryption_failed(recipient_user_id, "empty batch"))
    }

    /// Encrypt several messages for one recipient with a single key lookup.
    pub async fn encrypt_batch(
        &self,
        plaintexts: &[&str],
        recipient_user_id: &str,
    ) -> Result<Vec<EncryptedEnvelope>, E2eeError> {
        let wrap = |e: E2eeError| match e {
            E2eeError::EncryptionFailed { .. } => e,
            other => E2eeError::encryption_failed(recipient_user_id, other),
        };

        let sender_key_id = self.sender_key_id().await.map_err(wrap)?;
        let recipient_key = self.recovery.public_key_for(recipient_user_id).await.map_err(wrap)?;
        let now = self.keys.clock().now_millis();

        plaintexts
            .iter()
            .map(|text| {
                seal_with_key(text, &recipient_key, recipient_user_id, &sender_key_id, now)
                    .map_err(|e| E2eeError::encryption_failed(recipient_user_id, e))
            })
            .collect()
    }

    /// Decrypt with the local private key. A version other than
    /// [`ENVELOPE_VERSION`] is logged and attempted anyway.
    pub async fn decrypt_envelope(&self, envelope: &EncryptedEnvelope) -> Result<String, E2eeError> {
        if envelope.version != ENVELOPE_VERSION {
            warn!(
                "[envelope] version mismatch: expected {ENVELOPE_VERSION}, got {}",
                envelope.version
            );
        }
        let keys = self.keys.local_keys()?;
        open_with_key(envelope, &keys.private_key).map_err(E2eeError::DecryptionFailed)
    }

    /// Plaintext for any stored record. Never fails: undecryptable envelopes
    /// become the placeholder, unknown shapes their JSON text.
    pub async fn process_transparently(&self, record: &StoredRecord) -> String {
        match record {
            StoredRecord::Encrypted(envelope) => match self.decrypt_envelope(envelope).await {
                Ok(text) => text,
                Err(E2eeError::KeyNotInitialized) => {
                    let retried = match self.recovery.recover_key_not_initialized().await {
                        Ok(_) => self.decrypt_envelope(envelope).await,
                        Err(e) => Err(e),
                    };
                    retried.unwrap_or_else(|e| self.recovery.decryption_placeholder(&e))
                }
                Err(e) => self.recovery.decryption_placeholder(&e),
            },
            StoredRecord::Legacy(text) => text.clone(),
            StoredRecord::Unknown(value) => {
                debug!("[envelope] unknown record shape, passing through as JSON");
                value.to_string()
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
