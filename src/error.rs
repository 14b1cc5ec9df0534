//! The closed error taxonomy every public operation reports through.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::network::NetworkError;
use crate::store::StoreError;

/// Discriminant of [`E2eeError`], used to pick a recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    KeyNotInitialized,
    KeyNotFound,
    DecryptionFailed,
    EncryptionFailed,
    PublicKeyFetchFailed,
    KeyGenerationFailed,
    NetworkError,
    StorageFailed,
}

#[derive(Debug, Error)]
pub enum E2eeError {
    #[error("local key pair is not initialized")]
    KeyNotInitialized,

    #[error("no public key registered for user {user_id}")]
    KeyNotFound { user_id: String },

    #[error("decryption failed: {0}")]
    DecryptionFailed(#[source] CryptoError),

    #[error("encryption for {recipient} failed: {source}")]
    EncryptionFailed {
        recipient: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("public key lookup for {user_id} failed: {reason}")]
    PublicKeyFetchFailed { user_id: String, reason: String },

    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error(transparent)]
    NetworkError(#[from] NetworkError),

    #[error(transparent)]
    StorageFailed(#[from] StoreError),
}

impl E2eeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            E2eeError::KeyNotInitialized => ErrorKind::KeyNotInitialized,
            E2eeError::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            E2eeError::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            E2eeError::EncryptionFailed { .. } => ErrorKind::EncryptionFailed,
            E2eeError::PublicKeyFetchFailed { .. } => ErrorKind::PublicKeyFetchFailed,
            E2eeError::KeyGenerationFailed(_) => ErrorKind::KeyGenerationFailed,
            E2eeError::NetworkError(_) => ErrorKind::NetworkError,
            E2eeError::StorageFailed(_) => ErrorKind::StorageFailed,
        }
    }

    pub(crate) fn encryption_failed(
        recipient: &str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        E2eeError::EncryptionFailed { recipient: recipient.to_string(), source: source.into() }
    }

    /// User id the error is about, when it names one.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            E2eeError::KeyNotFound { user_id } | E2eeError::PublicKeyFetchFailed { user_id, .. } => {
                Some(user_id)
            }
            E2eeError::EncryptionFailed { recipient, .. } => Some(recipient),
            _ => None,
        }
    }
}
