//! Per-device key material: the persisted [`KeyPairRecord`] and the unlocked
//! [`LocalKeys`] held in memory once the record has been opened.

use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::{self, CryptoError, SymmetricKey, NONCE_LEN};

/// AES-GCM tag length; a protected blob shorter than nonce + tag is corrupt.
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("protected private key is malformed: {0}")]
    Malformed(String),
}

/// The one key pair stored per identity.
///
/// `encrypted_private_key` is `base64(nonce[12] || AES-GCM(pkcs8 pem))` under
/// the key derived from `(device_seed, salt)`. Older installs wrote the
/// public key as `publicKey` and the seed as `deviceId`; both still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPairRecord {
    #[serde(alias = "publicKey")]
    pub public_key_pem: String,
    pub encrypted_private_key: String,
    #[serde(alias = "deviceId")]
    pub device_seed: String,
    pub key_id: String,
    pub created_at: i64,
    pub salt: String,
}

/// Unlocked key pair. Never logged.
#[derive(Clone)]
pub struct LocalKeys {
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey,
    pub public_key_pem: String,
    pub key_id: String,
}

impl LocalKeys {
    /// Identifier stamped as `senderKeyId` on every envelope this device builds.
    pub fn fingerprint(&self) -> String {
        crypto::key_fingerprint(&self.public_key_pem)
    }
}

impl std::fmt::Debug for LocalKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeys")
            .field("key_id", &self.key_id)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

// ─── Record lifecycle ─────────────────────────────────────────────────────────

/// Generate a new key pair plus seed and salt, and seal the private half.
pub fn generate_record(now_ms: i64) -> Result<(KeyPairRecord, LocalKeys), KeyError> {
    let (private_key, public_key) = crypto::generate_key_pair()?;
    let device_seed = crypto::generate_device_seed();
    let salt        = crypto::generate_salt();
    let wrap_key    = crypto::derive_symmetric_key(&device_seed, &salt);

    let private_pem    = crypto::export_private_pem(&private_key)?;
    let public_key_pem = crypto::export_public_pem(&public_key)?;
    let key_id         = Uuid::new_v4().to_string();

    let record = KeyPairRecord {
        public_key_pem: public_key_pem.clone(),
        encrypted_private_key: protect_private_key(&private_pem, &wrap_key)?,
        device_seed,
        key_id: key_id.clone(),
        created_at: now_ms,
        salt: crypto::encode_base64(&salt),
    };
    let keys = LocalKeys { private_key, public_key, public_key_pem, key_id };
    Ok((record, keys))
}

/// Re-derive the protection key and recover the key pair from a stored record.
pub fn unlock_record(record: &KeyPairRecord) -> Result<LocalKeys, KeyError> {
    let salt     = crypto::decode_base64(&record.salt)?;
    let wrap_key = crypto::derive_symmetric_key(&record.device_seed, &salt);

    let private_pem = unprotect_private_key(&record.encrypted_private_key, &wrap_key)?;
    let private_key = crypto::import_private_pem(&private_pem)?;
    let public_key  = crypto::import_public_pem(&record.public_key_pem)?;

    if RsaPublicKey::from(&private_key) != public_key {
        return Err(KeyError::Malformed(
            "stored public key does not match the private key".into(),
        ));
    }

    Ok(LocalKeys {
        private_key,
        public_key,
        public_key_pem: record.public_key_pem.clone(),
        key_id: record.key_id.clone(),
    })
}

// ─── At-rest protection ───────────────────────────────────────────────────────

pub fn protect_private_key(private_pem: &str, key: &SymmetricKey) -> Result<String, KeyError> {
    let (ciphertext, nonce) = crypto::encrypt_aead(private_pem.as_bytes(), key)?;
    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(crypto::encode_base64(&blob))
}

pub fn unprotect_private_key(
    blob_b64: &str,
    key: &SymmetricKey,
) -> Result<Zeroizing<String>, KeyError> {
    let blob = crypto::decode_base64(blob_b64)?;
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(KeyError::Malformed(format!("{} bytes is too short", blob.len())));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let plaintext = crypto::decrypt_aead(ciphertext, key, nonce)?;
    String::from_utf8(plaintext)
        .map(Zeroizing::new)
        .map_err(|_| KeyError::Malformed("private key is not UTF-8".into()))
}
