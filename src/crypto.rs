//! Secret codec: the primitive operations every other module builds on.
//!
//! * RSA-OAEP (2048-bit, SHA-256) to wrap per-message symmetric keys.
//! * AES-256-GCM with a fresh 96-bit nonce for message bodies.
//! * PBKDF2-HMAC-SHA256 to derive the key that protects the private key at rest.
//!
//! Everything here is pure: no I/O, no logging, no persistence.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

// ─── Constants ────────────────────────────────────────────────────────────────

pub const RSA_BITS: usize       = 2048;
pub const SYMMETRIC_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize      = 12;
pub const SALT_LEN: usize       = 16;
pub const PBKDF2_ROUNDS: u32    = 100_000;
const FINGERPRINT_LEN: usize    = 8;

/// A 256-bit AES key, wiped from memory when dropped.
pub type SymmetricKey = Zeroizing<[u8; SYMMETRIC_KEY_LEN]>;

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("AEAD encryption failed")]
    AeadEncrypt,
    #[error("authentication failed: wrong key or tampered ciphertext")]
    AuthenticationFailed,
    #[error("nonce must be 12 bytes, got {0}")]
    InvalidNonce(usize),
    #[error("key wrap failed: {0}")]
    Wrap(String),
    #[error("key unwrap failed")]
    Unwrap,
    #[error("unwrapped key has length {0}, expected 32")]
    InvalidKeyLength(usize),
    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

// ─── Key generation ───────────────────────────────────────────────────────────

/// Generate a fresh RSA-2048 key pair for OAEP/SHA-256 use.
pub fn generate_key_pair() -> Result<(RsaPrivateKey, RsaPublicKey), CryptoError> {
    let private = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    let public = RsaPublicKey::from(&private);
    Ok((private, public))
}

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Opaque per-install secret that feeds the at-rest key derivation.
///
/// 32 random bytes hashed with SHA-256, base64 encoded.
pub fn generate_device_seed() -> String {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    encode_base64(&Sha256::digest(raw))
}

// ─── AEAD ─────────────────────────────────────────────────────────────────────

/// Encrypt with AES-256-GCM under a newly drawn nonce.
///
/// Returns `(ciphertext || tag, nonce)`.
pub fn encrypt_aead(
    plaintext: &[u8],
    key: &[u8; SYMMETRIC_KEY_LEN],
) -> Result<(Vec<u8>, [u8; NONCE_LEN]), CryptoError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher     = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::AeadEncrypt)?;

    Ok((ciphertext, nonce_bytes))
}

pub fn decrypt_aead(
    ciphertext: &[u8],
    key: &[u8; SYMMETRIC_KEY_LEN],
    nonce: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidNonce(nonce.len()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

// ─── Key wrapping ─────────────────────────────────────────────────────────────

/// RSA-OAEP(SHA-256) encrypt a symmetric key for `recipient`.
///
/// The output is exactly one modulus-sized block (256 bytes for RSA-2048).
pub fn wrap_key(
    key: &[u8; SYMMETRIC_KEY_LEN],
    recipient: &RsaPublicKey,
) -> Result<Vec<u8>, CryptoError> {
    recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key)
        .map_err(|e| CryptoError::Wrap(e.to_string()))
}

pub fn unwrap_key(wrapped: &[u8], own: &RsaPrivateKey) -> Result<SymmetricKey, CryptoError> {
    let raw = Zeroizing::new(
        own.decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|_| CryptoError::Unwrap)?,
    );
    if raw.len() != SYMMETRIC_KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(raw.len()));
    }
    let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]);
    key.copy_from_slice(&raw);
    Ok(key)
}

// ─── PEM ──────────────────────────────────────────────────────────────────────

/// SPKI ("BEGIN PUBLIC KEY") PEM with LF line endings.
pub fn export_public_pem(key: &RsaPublicKey) -> Result<String, CryptoError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// PKCS#8 ("BEGIN PRIVATE KEY") PEM with LF line endings.
pub fn export_private_pem(key: &RsaPrivateKey) -> Result<Zeroizing<String>, CryptoError> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

pub fn import_public_pem(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem.trim())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

pub fn import_private_pem(pem: &str) -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::from_pkcs8_pem(pem.trim())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

// ─── Encoding & derivation ────────────────────────────────────────────────────

pub fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(general_purpose::STANDARD.decode(text)?)
}

/// PBKDF2-HMAC-SHA256 over the device seed. Only used to protect the local
/// private key, never for message content.
pub fn derive_symmetric_key(seed: &str, salt: &[u8]) -> SymmetricKey {
    let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(seed.as_bytes(), salt, PBKDF2_ROUNDS, &mut key[..]);
    key
}

/// Short stable identifier for a public key: hex of the first 8 bytes of
/// SHA-256 over the PEM text.
pub fn key_fingerprint(public_key_pem: &str) -> String {
    let digest = Sha256::digest(public_key_pem.as_bytes());
    hex::encode(&digest[..FINGERPRINT_LEN])
}

// ─── Tests ────────────────────────────────────────────────────────────────────
