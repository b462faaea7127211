//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use lockbox_common::{Error, ItemId, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Default salt length in bytes.
pub const DEFAULT_SALT_LENGTH: usize = 32;

/// Minimum accepted salt length in bytes.
pub const MIN_SALT_LENGTH: usize = 16;

/// Maximum accepted salt length in bytes.
pub const MAX_SALT_LENGTH: usize = 64;

/// HKDF salt separating item keys from any other use of the master key.
const ITEM_KEY_DOMAIN: &[u8] = b"lockbox/item-key/v1";

/// Raw KDF output of caller-chosen length.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey(Vec<u8>);

impl DerivedKey {
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivedKey([REDACTED; {} bytes])", self.0.len())
    }
}

/// Master key derived from user password.
///
/// This key is the root of the key hierarchy and is used to derive
/// per-item keys. It only ever lives inside an unlocked vault.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Take ownership of a KDF output as a master key.
    ///
    /// # Errors
    /// - `InvalidKeyLength` if the derived key is not KEY_LENGTH bytes
    pub fn from_derived(derived: &DerivedKey) -> Result<Self> {
        if derived.len() != KEY_LENGTH {
            return Err(Error::InvalidKeyLength {
                expected: KEY_LENGTH,
                actual: derived.len(),
            });
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(derived.as_bytes());
        Ok(Self { key })
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Derive the key for one item.
    ///
    /// HKDF-SHA256 with a fixed domain label as salt and the item id as
    /// info. Item keys reveal neither the master key nor any sibling key.
    ///
    /// # Errors
    /// - `KeyDerivationFailed` if HKDF rejects the output length
    pub fn derive_item_key(&self, item_id: &ItemId) -> Result<ItemKey> {
        let hk = Hkdf::<Sha256>::new(Some(ITEM_KEY_DOMAIN), &self.key);
        let mut derived = [0u8; KEY_LENGTH];
        hk.expand(item_id.as_bytes(), &mut derived)
            .map_err(|e| Error::KeyDerivationFailed(format!("HKDF expand failed: {}", e)))?;

        let key = ItemKey::from_bytes(derived);
        derived.zeroize();
        Ok(key)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Key for encrypting a single item's payload.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ItemKey {
    key: [u8; KEY_LENGTH],
}

impl ItemKey {
    /// Create an item key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemKey([REDACTED])")
    }
}

/// Salt for password-based key derivation.
///
/// Non-secret; persisted with the account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(#[serde(with = "crate::encoding::base64_bytes")] Vec<u8>);

impl Salt {
    /// Generate a random salt of `length` bytes.
    ///
    /// # Errors
    /// - `InvalidParameter` if length is outside 16..=64
    pub fn generate(length: usize) -> Result<Self> {
        check_salt_length(length)?;
        let mut salt = vec![0u8; length];
        OsRng.fill_bytes(&mut salt);
        Ok(Self(salt))
    }

    /// Create from bytes.
    ///
    /// # Errors
    /// - `InvalidParameter` if length is outside 16..=64
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        check_salt_length(bytes.len())?;
        Ok(Self(bytes))
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub(crate) fn check_salt_length(length: usize) -> Result<()> {
    if !(MIN_SALT_LENGTH..=MAX_SALT_LENGTH).contains(&length) {
        return Err(Error::InvalidParameter(format!(
            "Salt length must be between {} and {} bytes, got {}",
            MIN_SALT_LENGTH, MAX_SALT_LENGTH, length
        )));
    }
    Ok(())
}
