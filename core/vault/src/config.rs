//! Account configuration and metadata.
//!
//! The account record is the only thing the engine persists itself. It is
//! non-secret: salt, KDF parameters, cipher preference and a canary
//! envelope that lets an unlock confirm the password.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use subtle::ConstantTimeEq;

use lockbox_common::{Error, ItemId, Password, Result};
use lockbox_crypto::keys::{MAX_SALT_LENGTH, MIN_SALT_LENGTH};
use lockbox_crypto::{
    Algorithm, CryptoProvider, DecryptContext, EncryptContext, EncryptionEnvelope, KdfAlgorithm,
    KdfParams, KeyDerivationService, MasterKey, RustCryptoProvider, Salt,
};

/// Item id under which the canary is sealed.
pub const CANARY_ITEM_ID: &str = "lockbox:canary";

const CANARY_PLAINTEXT: &[u8] = b"LOCKBOX_KEY_VERIFICATION_V1";

/// Account record format version for migration support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u32,
    pub minor: u32,
}

impl FormatVersion {
    /// Current format version.
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Check if this version is compatible with the current version.
    pub fn is_compatible(&self) -> bool {
        self.major == Self::CURRENT.major
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Creation options for [`AccountConfig::create`].
#[derive(Debug, Clone, Default)]
pub struct AccountOptions {
    /// Pin a cipher instead of letting the selector choose.
    pub cipher_preference: Option<Algorithm>,
    /// Idle time before the vault locks itself.
    pub auto_lock_secs: Option<u64>,
    /// Salt length in bytes; defaults to 32.
    pub salt_length: Option<usize>,
}

/// Persisted, non-secret account configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Record format version.
    pub version: FormatVersion,
    /// Salt for master key derivation, one per account.
    pub salt: Salt,
    /// KDF cost parameters the master key was derived with.
    pub kdf_params: KdfParams,
    /// KDF the master key was derived with.
    pub kdf_algorithm: KdfAlgorithm,
    /// Cipher pinned by the user, if any.
    #[serde(default)]
    pub cipher_preference: Option<Algorithm>,
    /// Auto-lock idle timeout in seconds.
    #[serde(default)]
    pub auto_lock_secs: Option<u64>,
    /// Known constant sealed under the master key.
    #[serde(default)]
    pub canary: Option<EncryptionEnvelope>,
    /// Account creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub modified_at: DateTime<Utc>,
}

impl AccountConfig {
    /// Create a new account configuration.
    ///
    /// Generates a salt, derives the master key with the best available KDF
    /// and seals the canary. The master key is dropped before returning.
    ///
    /// # Errors
    /// - `InvalidParameter` for a bad password, salt length or params
    /// - `KeyDerivationFailed` if derivation fails
    pub fn create(password: &Password, kdf_params: KdfParams, options: AccountOptions) -> Result<Self> {
        Self::create_with(
            password,
            kdf_params,
            options,
            &RustCryptoProvider::new(),
            &KeyDerivationService::probe(),
        )
    }

    /// Create a new account configuration with an explicit cipher backend
    /// and KDF.
    ///
    /// # Errors
    /// - `InvalidParameter` for a bad password, salt length or params
    /// - `KeyDerivationFailed` if derivation fails
    /// - `AlgorithmNotSupported` if `provider` lacks the canary cipher
    pub fn create_with(
        password: &Password,
        kdf_params: KdfParams,
        options: AccountOptions,
        provider: &dyn CryptoProvider,
        kdf: &KeyDerivationService,
    ) -> Result<Self> {
        let salt = KeyDerivationService::generate_salt(
            options.salt_length.unwrap_or(lockbox_crypto::keys::DEFAULT_SALT_LENGTH),
        )?;

        let derived = kdf.derive_key(password, salt.as_bytes(), &kdf_params)?;
        KeyDerivationService::validate_derived_key(derived.key.as_bytes())?;
        let master_key = MasterKey::from_derived(&derived.key)?;

        let canary_algorithm = options
            .cipher_preference
            .unwrap_or(Algorithm::XChaCha20Poly1305);
        let canary = seal_canary(provider, &master_key, canary_algorithm)?;

        let now = Utc::now();
        Ok(Self {
            version: FormatVersion::CURRENT,
            salt,
            kdf_params,
            kdf_algorithm: derived.algorithm,
            cipher_preference: options.cipher_preference,
            auto_lock_secs: options.auto_lock_secs,
            canary: Some(canary),
            created_at: now,
            modified_at: now,
        })
    }

    /// Copy of this record re-keyed under new KDF settings.
    pub(crate) fn rekeyed(
        &self,
        salt: Salt,
        kdf_params: KdfParams,
        kdf_algorithm: KdfAlgorithm,
        canary: EncryptionEnvelope,
    ) -> Self {
        Self {
            salt,
            kdf_params,
            kdf_algorithm,
            canary: Some(canary),
            modified_at: Utc::now(),
            ..self.clone()
        }
    }

    /// Check the record is usable.
    ///
    /// # Errors
    /// - `InvalidParameter` for an incompatible version, salt or params
    /// - `InvalidDataSize` for a malformed canary
    pub fn validate(&self) -> Result<()> {
        if !self.version.is_compatible() {
            return Err(Error::InvalidParameter(format!(
                "Incompatible account format version: {}.{}",
                self.version.major, self.version.minor
            )));
        }
        if !(MIN_SALT_LENGTH..=MAX_SALT_LENGTH).contains(&self.salt.len()) {
            return Err(Error::InvalidParameter(format!(
                "Stored salt has invalid length {}",
                self.salt.len()
            )));
        }
        self.kdf_params.validate()?;
        if let Some(canary) = &self.canary {
            canary.validate()?;
        }
        Ok(())
    }

    /// Whether the stored KDF settings fall short of `target`.
    ///
    /// True if any cost is lower than the target's, or if the account was
    /// derived with PBKDF2 while `available` is Argon2id.
    pub fn needs_kdf_upgrade(&self, target: &KdfParams, available: KdfAlgorithm) -> bool {
        self.kdf_params.is_weaker_than(target)
            || (self.kdf_algorithm == KdfAlgorithm::Pbkdf2HmacSha256
                && available == KdfAlgorithm::Argon2id)
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let config: Self =
            serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the record to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Read a record from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

fn canary_item_id() -> Result<ItemId> {
    ItemId::new(CANARY_ITEM_ID)
}

/// Seal the canary constant under the master key.
pub(crate) fn seal_canary(
    provider: &dyn CryptoProvider,
    master_key: &MasterKey,
    algorithm: Algorithm,
) -> Result<EncryptionEnvelope> {
    let item_id = canary_item_id()?;
    let item_key = master_key.derive_item_key(&item_id)?;
    provider.cipher(algorithm)?.encrypt(
        CANARY_PLAINTEXT,
        item_key.as_bytes(),
        &EncryptContext::with_additional_data(item_id.as_bytes()),
    )
}

/// Confirm `master_key` opens the canary.
///
/// # Errors
/// - `AlgorithmNotSupported` if `provider` lacks the canary cipher
/// - `DecryptionFailed` if the key is wrong
pub(crate) fn verify_canary(
    provider: &dyn CryptoProvider,
    master_key: &MasterKey,
    canary: &EncryptionEnvelope,
) -> Result<()> {
    let item_id = canary_item_id()?;
    let item_key = master_key.derive_item_key(&item_id)?;
    let context = DecryptContext::default().with_additional_data(item_id.as_bytes());

    let cipher = provider.cipher(canary.algorithm)?;
    let plaintext = cipher
        .decrypt(canary, item_key.as_bytes(), &context)
        .map_err(|_| Error::DecryptionFailed("Password verification failed".to_string()))?;

    if !bool::from(plaintext.as_slice().ct_eq(CANARY_PLAINTEXT)) {
        return Err(Error::DecryptionFailed(
            "Password verification failed".to_string(),
        ));
    }
    Ok(())
}
