//! Common error types for Lockbox.

use thiserror::Error;

/// Message shown to callers outside the engine for any decryption-class failure.
pub const CANNOT_DECRYPT: &str = "cannot decrypt";

/// Top-level error type for Lockbox operations.
///
/// Messages never carry password or key material. Decryption-class variants
/// keep their detail for engine logging only; see [`Error::public_message`].
#[derive(Debug, Error)]
pub enum Error {
    /// Key was not the required length.
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Plaintext, ciphertext, nonce or tag had an unusable size.
    #[error("Invalid data size: {0}")]
    InvalidDataSize(String),

    /// Password, salt or cost parameter out of bounds.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Algorithm unknown, unavailable, or not the one the envelope records.
    #[error("Algorithm not supported: {0}")]
    AlgorithmNotSupported(String),

    /// The AEAD primitive refused to encrypt.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Authentication failed (tampering, wrong key or wrong associated data).
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Envelope is older than the caller's maximum age.
    #[error("Data expired: age {age_ms} ms exceeds maximum {max_age_ms} ms")]
    DataExpired { age_ms: i64, max_age_ms: i64 },

    /// The KDF primitive failed.
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// Operation requires an unlocked vault.
    #[error("Vault is locked")]
    VaultLocked,

    /// Operation was cancelled before it completed.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error belongs to the decryption class.
    ///
    /// Tag mismatch, algorithm mismatch and expiry are indistinguishable to
    /// callers outside the engine.
    pub fn is_decryption_failure(&self) -> bool {
        matches!(
            self,
            Error::DecryptionFailed(_) | Error::AlgorithmNotSupported(_) | Error::DataExpired { .. }
        )
    }

    /// Message safe to show to end users.
    pub fn public_message(&self) -> String {
        if self.is_decryption_failure() {
            CANNOT_DECRYPT.to_string()
        } else {
            self.to_string()
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
