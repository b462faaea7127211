//! Master/item key hierarchy and the locked/unlocked lifecycle.
//!
//! The master key lives only inside an unlocked [`VaultKeyHierarchy`].
//! Item keys are derived on demand for a single operation and dropped
//! (zeroized) when it returns.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lockbox_common::{Error, ItemId, Password, Result, SensitiveBytes};
use lockbox_crypto::envelope::now_millis;
use lockbox_crypto::{
    Algorithm, AlgorithmSelection, AlgorithmSelector, CryptoProvider, DecryptContext,
    EncryptContext, EncryptionEnvelope, ItemKey, KdfAlgorithm, KdfParams, KeyDerivationResult,
    KeyDerivationService, MasterKey, RustCryptoProvider, Salt,
};

use crate::audit::{AuditEvent, AuditSink, FailureKind, LockReason, TracingAuditSink};
use crate::config::{seal_canary, verify_canary, AccountConfig};

/// Lifecycle state of the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No master key in memory.
    Locked,
    /// Master key available; item operations permitted.
    Unlocked,
}

/// Outcome of a successful unlock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnlockReport {
    pub kdf_algorithm: KdfAlgorithm,
    pub derivation_time: Duration,
    /// Stored KDF settings are weaker than the configured target or the
    /// best available KDF; call [`VaultKeyHierarchy::rotate_kdf`].
    pub kdf_upgrade_recommended: bool,
}

struct Account {
    config: AccountConfig,
    kdf: KeyDerivationService,
}

struct Lifecycle {
    /// Bumped on every lock and committed rotation. Work started under an
    /// older epoch must not install a key.
    lock_epoch: u64,
    timer_seq: u64,
    cancel_root: CancellationToken,
    timer: Option<JoinHandle<()>>,
    rotation_seq: u64,
    /// New master key of a prepared rotation. Dropped on lock.
    pending_rotation: Option<PendingRotation>,
}

struct Inner {
    account: RwLock<Account>,
    provider: Arc<dyn CryptoProvider>,
    selection: AlgorithmSelection,
    audit: Arc<dyn AuditSink>,
    auto_lock: Option<Duration>,
    max_envelope_age: Option<Duration>,
    kdf_upgrade_target: Option<KdfParams>,
    preferred_kdf: KdfAlgorithm,
    // Lock order: `lifecycle` before `master_key`.
    lifecycle: Mutex<Lifecycle>,
    master_key: RwLock<Option<MasterKey>>,
}

/// Builder for [`VaultKeyHierarchy`].
pub struct HierarchyBuilder {
    config: AccountConfig,
    provider: Option<Arc<dyn CryptoProvider>>,
    selector: Option<AlgorithmSelector>,
    audit: Option<Arc<dyn AuditSink>>,
    kdf: Option<KeyDerivationService>,
    auto_lock: Option<Duration>,
    max_envelope_age: Option<Duration>,
    kdf_upgrade_target: Option<KdfParams>,
}

impl HierarchyBuilder {
    fn new(config: AccountConfig) -> Self {
        Self {
            config,
            provider: None,
            selector: None,
            audit: None,
            kdf: None,
            auto_lock: None,
            max_envelope_age: None,
            kdf_upgrade_target: None,
        }
    }

    /// Crypto backend. Defaults to [`RustCryptoProvider`].
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn CryptoProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Cipher selector. Defaults to one over the chosen provider.
    #[must_use]
    pub fn selector(mut self, selector: AlgorithmSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Audit receiver. Defaults to [`TracingAuditSink`].
    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// KDF used to unlock. Must match the account's recorded algorithm.
    #[must_use]
    pub fn kdf(mut self, kdf: KeyDerivationService) -> Self {
        self.kdf = Some(kdf);
        self
    }

    /// Idle timeout; overrides the account's `auto_lock_secs`.
    #[must_use]
    pub fn auto_lock(mut self, timeout: Duration) -> Self {
        self.auto_lock = Some(timeout);
        self
    }

    /// Reject envelopes older than `max_age` on decrypt.
    #[must_use]
    pub fn max_envelope_age(mut self, max_age: Duration) -> Self {
        self.max_envelope_age = Some(max_age);
        self
    }

    /// KDF parameters below which an unlock recommends rotation.
    #[must_use]
    pub fn kdf_upgrade_target(mut self, params: KdfParams) -> Self {
        self.kdf_upgrade_target = Some(params);
        self
    }

    /// Validate the account and choose the cipher.
    ///
    /// # Errors
    /// - `InvalidParameter` if the account record is unusable or the KDF
    ///   does not match it
    /// - `AlgorithmNotSupported` if the preferred cipher or the account's
    ///   KDF is unavailable here
    pub fn build(self) -> Result<VaultKeyHierarchy> {
        self.config.validate()?;

        let provider = self
            .provider
            .unwrap_or_else(|| Arc::new(RustCryptoProvider::new()));
        let selector = self
            .selector
            .unwrap_or_else(|| AlgorithmSelector::new(provider.clone()));
        let selection = match self.config.cipher_preference {
            Some(algorithm) => selector.force_algorithm(algorithm)?,
            None => selector.select_optimal_algorithm()?,
        };

        let kdf = match self.kdf {
            Some(kdf) => kdf,
            None => KeyDerivationService::for_algorithm(self.config.kdf_algorithm)?,
        };
        if kdf.algorithm() != self.config.kdf_algorithm {
            return Err(Error::InvalidParameter(format!(
                "Account was derived with {}, KDF is {}",
                self.config.kdf_algorithm,
                kdf.algorithm()
            )));
        }

        let auto_lock = self
            .auto_lock
            .or_else(|| self.config.auto_lock_secs.map(Duration::from_secs));
        let preferred_kdf = KeyDerivationService::probe().algorithm();

        info!(
            algorithm = %selection.algorithm,
            reason = ?selection.reason,
            kdf = %kdf.algorithm(),
            auto_lock_secs = auto_lock.map(|d| d.as_secs()),
            "Vault key hierarchy ready"
        );

        Ok(VaultKeyHierarchy {
            inner: Arc::new(Inner {
                account: RwLock::new(Account {
                    config: self.config,
                    kdf,
                }),
                provider,
                selection,
                audit: self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink)),
                auto_lock,
                max_envelope_age: self.max_envelope_age,
                kdf_upgrade_target: self.kdf_upgrade_target,
                preferred_kdf,
                lifecycle: Mutex::new(Lifecycle {
                    lock_epoch: 0,
                    timer_seq: 0,
                    cancel_root: CancellationToken::new(),
                    timer: None,
                    rotation_seq: 0,
                    pending_rotation: None,
                }),
                master_key: RwLock::new(None),
            }),
        })
    }
}

/// Owns the master key and the locked/unlocked lifecycle.
///
/// Cloning yields another handle to the same vault.
#[derive(Clone)]
pub struct VaultKeyHierarchy {
    inner: Arc<Inner>,
}

impl fmt::Debug for VaultKeyHierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultKeyHierarchy")
            .field("algorithm", &self.inner.selection.algorithm)
            .field("auto_lock", &self.inner.auto_lock)
            .field("master_key", &"[REDACTED]")
            .finish()
    }
}

impl VaultKeyHierarchy {
    /// Start building a hierarchy for `config`.
    pub fn builder(config: AccountConfig) -> HierarchyBuilder {
        HierarchyBuilder::new(config)
    }

    /// Build with defaults.
    pub fn new(config: AccountConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Derive the master key from `password` and enter Unlocked.
    ///
    /// Derivation runs off the async executor. A [`lock`](Self::lock)
    /// arriving meanwhile cancels it and the derived bytes are zeroized
    /// rather than installed.
    ///
    /// # Postconditions
    /// - On success the state is Unlocked and the auto-lock timer is armed
    /// - On any failure the state is unchanged
    ///
    /// # Errors
    /// - `InvalidParameter` for a password outside 1..=4096 characters
    /// - `DecryptionFailed` if the password is wrong
    /// - `Cancelled` if the vault was locked during derivation
    /// - `KeyDerivationFailed` if the primitive fails
    pub async fn unlock(&self, password: &Password) -> Result<UnlockReport> {
        match self.inner.unlock(password).await {
            Ok(report) => {
                self.inner.audit.record(&AuditEvent::UnlockSucceeded {
                    kdf: report.kdf_algorithm,
                    derivation_ms: report.derivation_time.as_millis() as u64,
                });
                info!(
                    kdf = %report.kdf_algorithm,
                    derivation_ms = report.derivation_time.as_millis() as u64,
                    upgrade_recommended = report.kdf_upgrade_recommended,
                    "Vault unlocked"
                );
                Ok(report)
            }
            Err(e) => {
                warn!("Unlock failed: {}", e);
                self.inner.audit.record(&AuditEvent::UnlockFailed {
                    failure: FailureKind::from(&e),
                });
                Err(e)
            }
        }
    }

    /// Drop the master key and enter Locked.
    ///
    /// Cancels in-flight derivations and the auto-lock timer. Locking a
    /// locked vault is a no-op apart from the cancellation.
    pub async fn lock(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if let Some(timer) = lifecycle.timer.take() {
            timer.abort();
        }
        self.inner.clear(&mut lifecycle, LockReason::Explicit).await;
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LockState {
        if self.inner.master_key.read().await.is_some() {
            LockState::Unlocked
        } else {
            LockState::Locked
        }
    }

    pub async fn is_unlocked(&self) -> bool {
        self.state().await == LockState::Unlocked
    }

    /// Record activity, resetting the auto-lock timer while unlocked.
    pub async fn touch(&self) {
        self.inner.touch().await;
    }

    /// Cipher used for new envelopes.
    pub fn algorithm(&self) -> Algorithm {
        self.inner.selection.algorithm
    }

    pub fn selection(&self) -> &AlgorithmSelection {
        &self.inner.selection
    }

    pub fn auto_lock(&self) -> Option<Duration> {
        self.inner.auto_lock
    }

    /// Snapshot of the current account record.
    pub async fn account_config(&self) -> AccountConfig {
        self.inner.account.read().await.config.clone()
    }

    /// Derive the key for `item_id` from the master key.
    ///
    /// Deterministic for a given master key and id. Resets the auto-lock
    /// timer.
    ///
    /// # Errors
    /// - `VaultLocked` if not unlocked
    pub async fn derive_item_key(&self, item_id: &ItemId) -> Result<ItemKey> {
        let item_key = {
            let master_key = self.inner.master_key.read().await;
            master_key
                .as_ref()
                .ok_or(Error::VaultLocked)?
                .derive_item_key(item_id)?
        };
        self.inner.touch().await;
        Ok(item_key)
    }

    /// Encrypt `plaintext` for `item_id` with the selected cipher.
    ///
    /// The item id is bound as associated data, so an envelope cannot be
    /// replayed under another id.
    ///
    /// # Errors
    /// - `VaultLocked` if not unlocked
    /// - `InvalidDataSize` for empty plaintext
    pub async fn encrypt_item(
        &self,
        item_id: &ItemId,
        plaintext: &[u8],
    ) -> Result<EncryptionEnvelope> {
        let item_key = self.derive_item_key(item_id).await?;
        let algorithm = self.inner.selection.algorithm;

        let envelope = self.inner.provider.cipher(algorithm)?.encrypt(
            plaintext,
            item_key.as_bytes(),
            &EncryptContext::with_additional_data(item_id.as_bytes()),
        )?;

        self.inner.audit.record(&AuditEvent::ItemEncrypted {
            item_id: item_id.to_string(),
            algorithm,
        });
        Ok(envelope)
    }

    /// Decrypt an envelope stored under `item_id`.
    ///
    /// The cipher is chosen from the envelope's recorded algorithm. Failures
    /// are final and are not retried; the detailed reason goes to the debug
    /// log, callers should surface [`Error::public_message`].
    ///
    /// # Errors
    /// - `VaultLocked` if not unlocked
    /// - `DecryptionFailed`, `AlgorithmNotSupported` or `DataExpired`
    pub async fn decrypt_item(
        &self,
        item_id: &ItemId,
        envelope: &EncryptionEnvelope,
    ) -> Result<SensitiveBytes> {
        self.inner.audit.record(&AuditEvent::DecryptAttempted {
            item_id: item_id.to_string(),
            algorithm: envelope.algorithm,
            envelope_age_ms: envelope.age_ms(now_millis()),
        });

        let result = self.open_item(item_id, envelope).await;
        if let Err(e) = &result {
            debug!(%item_id, algorithm = %envelope.algorithm, error = %e, "Item decryption failed");
            self.inner.audit.record(&AuditEvent::DecryptFailed {
                item_id: item_id.to_string(),
                algorithm: envelope.algorithm,
                failure: FailureKind::from(e),
            });
        }
        result
    }

    async fn open_item(
        &self,
        item_id: &ItemId,
        envelope: &EncryptionEnvelope,
    ) -> Result<SensitiveBytes> {
        let item_key = self.derive_item_key(item_id).await?;

        let mut context = DecryptContext::default().with_additional_data(item_id.as_bytes());
        if let Some(max_age) = self.inner.max_envelope_age {
            context = context.with_max_age(max_age);
        }

        self.inner
            .provider
            .cipher(envelope.algorithm)?
            .decrypt(envelope, item_key.as_bytes(), &context)
            .map(SensitiveBytes::from)
    }

    /// Prepare a master key rotation under `params`.
    ///
    /// Re-derives with the current settings to confirm `password`, then
    /// derives a new master key with a fresh salt and the best available
    /// KDF. The new key is held by the hierarchy, and nothing changes until
    /// [`commit_rotation`](Self::commit_rotation). Preparing again replaces
    /// an earlier pending rotation.
    ///
    /// # Errors
    /// - `VaultLocked` if not unlocked
    /// - `DecryptionFailed` if `password` does not match
    /// - `InvalidParameter` if `params` are out of bounds
    /// - `Cancelled` if the vault is locked meanwhile
    pub async fn rotate_kdf(&self, password: &Password, params: KdfParams) -> Result<KeyRotation> {
        params.validate()?;

        let (token, epoch) = self.inner.begin_operation().await;
        let old_key = self
            .inner
            .master_key
            .read()
            .await
            .clone()
            .ok_or(Error::VaultLocked)?;
        let (config, kdf) = self.inner.account_snapshot().await;

        let current = derive_key_cancellable(
            kdf,
            password.clone(),
            config.salt.clone(),
            config.kdf_params,
            token.clone(),
        )
        .await?;
        let current_key = MasterKey::from_derived(&current.key)?;
        let matches = bool::from(current_key.as_bytes().ct_eq(old_key.as_bytes()));
        drop(old_key);
        if !matches {
            return Err(Error::DecryptionFailed(
                "Password verification failed".to_string(),
            ));
        }

        let new_kdf = KeyDerivationService::for_algorithm(self.inner.preferred_kdf)?;
        let new_salt = KeyDerivationService::generate_salt(config.salt.len())?;
        let derived = derive_key_cancellable(
            new_kdf.clone(),
            password.clone(),
            new_salt.clone(),
            params,
            token,
        )
        .await?;
        KeyDerivationService::validate_derived_key(derived.key.as_bytes())?;
        let new_key = MasterKey::from_derived(&derived.key)?;

        let canary_algorithm = config
            .cipher_preference
            .unwrap_or(self.inner.selection.algorithm);
        let canary = seal_canary(self.inner.provider.as_ref(), &new_key, canary_algorithm)?;
        let new_config = config.rekeyed(new_salt, params, derived.algorithm, canary);

        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.lock_epoch != epoch {
            return Err(Error::Cancelled(
                "Vault locked during rotation".to_string(),
            ));
        }
        lifecycle.rotation_seq += 1;
        let seq = lifecycle.rotation_seq;
        lifecycle.pending_rotation = Some(PendingRotation {
            seq,
            new_key,
            new_config: new_config.clone(),
            new_kdf,
        });
        drop(lifecycle);

        debug!(kdf = %derived.algorithm, "Prepared key rotation");
        Ok(KeyRotation {
            seq,
            epoch,
            new_config,
        })
    }

    /// Move one item's envelope from the current master key to the key of
    /// a prepared rotation.
    ///
    /// Resets the auto-lock timer.
    ///
    /// # Errors
    /// - `VaultLocked` if not unlocked
    /// - `Cancelled` if the vault was locked, or another rotation prepared,
    ///   since `rotation` was prepared
    /// - `DecryptionFailed` if the envelope does not open under the current key
    pub async fn reencrypt_item(
        &self,
        rotation: &KeyRotation,
        item_id: &ItemId,
        envelope: &EncryptionEnvelope,
    ) -> Result<EncryptionEnvelope> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let reencrypted = {
            let master_key = self.inner.master_key.read().await;
            let old_key = master_key.as_ref().ok_or(Error::VaultLocked)?;
            let pending = lifecycle.pending_for(rotation)?;

            let old_item_key = old_key.derive_item_key(item_id)?;
            let plaintext = SensitiveBytes::from(
                self.inner.provider.cipher(envelope.algorithm)?.decrypt(
                    envelope,
                    old_item_key.as_bytes(),
                    &DecryptContext::default().with_additional_data(item_id.as_bytes()),
                )?,
            );

            let new_item_key = pending.new_key.derive_item_key(item_id)?;
            self.inner
                .provider
                .cipher(self.inner.selection.algorithm)?
                .encrypt(
                    plaintext.as_bytes(),
                    new_item_key.as_bytes(),
                    &EncryptContext::with_additional_data(item_id.as_bytes()),
                )?
        };
        if lifecycle.timer.is_some() {
            self.inner.arm_timer(&mut lifecycle);
        }
        Ok(reencrypted)
    }

    /// Install a prepared rotation.
    ///
    /// Returns the new account record, which the caller persists alongside
    /// the envelopes moved with [`reencrypt_item`](Self::reencrypt_item).
    ///
    /// # Errors
    /// - `VaultLocked` if not unlocked
    /// - `Cancelled` if the vault was locked or rotated since preparation
    pub async fn commit_rotation(&self, rotation: KeyRotation) -> Result<AccountConfig> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.master_key.read().await.is_none() {
            return Err(Error::VaultLocked);
        }
        lifecycle.pending_for(&rotation)?;
        let pending = lifecycle
            .pending_rotation
            .take()
            .ok_or_else(|| Error::Cancelled("No rotation pending".to_string()))?;

        *self.inner.master_key.write().await = Some(pending.new_key);
        lifecycle.lock_epoch += 1;

        let kdf_algorithm = pending.new_config.kdf_algorithm;
        {
            let mut account = self.inner.account.write().await;
            account.config = pending.new_config.clone();
            account.kdf = pending.new_kdf;
        }
        if lifecycle.timer.is_some() {
            self.inner.arm_timer(&mut lifecycle);
        }
        drop(lifecycle);

        self.inner
            .audit
            .record(&AuditEvent::KdfRotated { kdf: kdf_algorithm });
        info!(kdf = %kdf_algorithm, "Master key rotated");
        Ok(pending.new_config)
    }
}

/// Handle to a prepared master key rotation.
///
/// The new master key stays inside the hierarchy and is discarded on lock.
/// The handle only names it and carries the non-secret account record.
#[derive(Debug, Clone)]
pub struct KeyRotation {
    seq: u64,
    epoch: u64,
    new_config: AccountConfig,
}

impl KeyRotation {
    /// Account record that takes effect on commit.
    pub fn new_config(&self) -> &AccountConfig {
        &self.new_config
    }
}

struct PendingRotation {
    seq: u64,
    new_key: MasterKey,
    new_config: AccountConfig,
    new_kdf: KeyDerivationService,
}

impl Lifecycle {
    fn pending_for(&self, rotation: &KeyRotation) -> Result<&PendingRotation> {
        match &self.pending_rotation {
            Some(pending) if pending.seq == rotation.seq && self.lock_epoch == rotation.epoch => {
                Ok(pending)
            }
            _ => Err(Error::Cancelled(
                "Vault state changed during rotation".to_string(),
            )),
        }
    }
}

impl Inner {
    async fn unlock(self: &Arc<Self>, password: &Password) -> Result<UnlockReport> {
        password.validate()?;
        let (token, epoch) = self.begin_operation().await;
        let (config, kdf) = self.account_snapshot().await;

        let derived = derive_key_cancellable(
            kdf,
            password.clone(),
            config.salt.clone(),
            config.kdf_params,
            token,
        )
        .await?;
        KeyDerivationService::validate_derived_key(derived.key.as_bytes())?;
        let master_key = MasterKey::from_derived(&derived.key)?;
        match &config.canary {
            Some(canary) => verify_canary(self.provider.as_ref(), &master_key, canary)?,
            None => warn!("Account has no verification record; password not checked"),
        }

        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.lock_epoch != epoch {
            return Err(Error::Cancelled(
                "Vault locked during unlock".to_string(),
            ));
        }
        *self.master_key.write().await = Some(master_key);
        self.arm_timer(&mut lifecycle);
        drop(lifecycle);

        let target = self.kdf_upgrade_target.unwrap_or(config.kdf_params);
        Ok(UnlockReport {
            kdf_algorithm: derived.algorithm,
            derivation_time: derived.derivation_time,
            kdf_upgrade_recommended: config.needs_kdf_upgrade(&target, self.preferred_kdf),
        })
    }

    async fn begin_operation(&self) -> (CancellationToken, u64) {
        let lifecycle = self.lifecycle.lock().await;
        (lifecycle.cancel_root.child_token(), lifecycle.lock_epoch)
    }

    async fn account_snapshot(&self) -> (AccountConfig, KeyDerivationService) {
        let account = self.account.read().await;
        (account.config.clone(), account.kdf.clone())
    }

    fn arm_timer(self: &Arc<Self>, lifecycle: &mut Lifecycle) {
        let Some(timeout) = self.auto_lock else {
            return;
        };
        if let Some(timer) = lifecycle.timer.take() {
            timer.abort();
        }

        lifecycle.timer_seq += 1;
        let seq = lifecycle.timer_seq;
        let inner: Weak<Self> = Arc::downgrade(self);
        lifecycle.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(seq).await;
            }
        }));
    }

    /// Reset the idle timer if one is running.
    async fn touch(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.timer.is_some() {
            self.arm_timer(&mut lifecycle);
        }
    }

    async fn expire(&self, seq: u64) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.timer_seq != seq || lifecycle.timer.is_none() {
            return;
        }
        // Detach our own handle; aborting it would cancel this task.
        lifecycle.timer = None;
        self.clear(&mut lifecycle, LockReason::Timeout).await;
    }

    async fn clear(&self, lifecycle: &mut Lifecycle, reason: LockReason) {
        lifecycle.lock_epoch += 1;
        lifecycle.cancel_root.cancel();
        lifecycle.cancel_root = CancellationToken::new();
        lifecycle.pending_rotation = None;

        let key = self.master_key.write().await.take();
        if key.is_some() {
            drop(key);
            self.audit.record(&AuditEvent::Locked { reason });
            info!(?reason, "Vault locked");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.lifecycle.get_mut().timer.take() {
            timer.abort();
        }
    }
}

/// Run a KDF derivation on the blocking pool, abandoning it on `cancel`.
///
/// An abandoned result is dropped, and therefore zeroized, when the
/// blocking task finishes.
async fn derive_key_cancellable(
    kdf: KeyDerivationService,
    password: Password,
    salt: Salt,
    params: KdfParams,
    cancel: CancellationToken,
) -> Result<KeyDerivationResult> {
    let task =
        tokio::task::spawn_blocking(move || kdf.derive_key(&password, salt.as_bytes(), &params));

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled("Key derivation cancelled".to_string())),
        joined = task => joined
            .map_err(|e| Error::KeyDerivationFailed(format!("Derivation task failed: {}", e)))?,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::config::AccountOptions;
    use lockbox_crypto::{Argon2idBackend, KdfBackend};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::oneshot;

    fn fast_params() -> KdfParams {
        KdfParams {
            time_cost: 1,
            memory_cost: 8192,
            parallelism: 1,
            output_length: 32,
        }
    }

    fn account(password: &str) -> AccountConfig {
        let options = AccountOptions {
            cipher_preference: Some(Algorithm::XChaCha20Poly1305),
            ..Default::default()
        };
        AccountConfig::create(&Password::new(password), fast_params(), options).unwrap()
    }

    fn item(id: &str) -> ItemId {
        ItemId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_lock_lifecycle() {
        let vault = VaultKeyHierarchy::new(account("hunter2")).unwrap();
        let id = item("login/github");

        assert_eq!(vault.state().await, LockState::Locked);
        assert!(matches!(
            vault.derive_item_key(&id).await,
            Err(Error::VaultLocked)
        ));

        vault.unlock(&"hunter2".into()).await.unwrap();
        assert_eq!(vault.state().await, LockState::Unlocked);
        assert!(vault.derive_item_key(&id).await.is_ok());

        vault.lock().await;
        assert_eq!(vault.state().await, LockState::Locked);
        assert!(matches!(
            vault.derive_item_key(&id).await,
            Err(Error::VaultLocked)
        ));
    }

    #[tokio::test]
    async fn test_item_keys_are_deterministic_and_distinct() {
        let vault = VaultKeyHierarchy::new(account("pw")).unwrap();
        vault.unlock(&"pw".into()).await.unwrap();

        let a1 = vault.derive_item_key(&item("a")).await.unwrap();
        let a2 = vault.derive_item_key(&item("a")).await.unwrap();
        let b = vault.derive_item_key(&item("b")).await.unwrap();

        assert_eq!(a1.as_bytes(), a2.as_bytes());
        assert_ne!(a1.as_bytes(), b.as_bytes());
    }

    #[tokio::test]
    async fn test_wrong_password_stays_locked() {
        let sink = Arc::new(MemoryAuditSink::new());
        let vault = VaultKeyHierarchy::builder(account("right"))
            .audit(sink.clone())
            .build()
            .unwrap();

        let err = vault.unlock(&"wrong".into()).await.unwrap_err();
        assert!(matches!(err, Error::DecryptionFailed(_)));
        assert_eq!(err.public_message(), "cannot decrypt");
        assert_eq!(vault.state().await, LockState::Locked);
        assert_eq!(
            sink.events(),
            vec![AuditEvent::UnlockFailed {
                failure: FailureKind::Decryption
            }]
        );
    }

    #[tokio::test]
    async fn test_invalid_password_rejected_before_derivation() {
        let vault = VaultKeyHierarchy::new(account("pw")).unwrap();
        let long = "x".repeat(4097);
        assert!(matches!(
            vault.unlock(&"".into()).await,
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            vault.unlock(&long.into()).await,
            Err(Error::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_item() {
        let sink = Arc::new(MemoryAuditSink::new());
        let vault = VaultKeyHierarchy::builder(account("pw"))
            .audit(sink.clone())
            .build()
            .unwrap();
        vault.unlock(&"pw".into()).await.unwrap();

        let id = item("note/1");
        let envelope = vault.encrypt_item(&id, b"my secret note").await.unwrap();
        assert_eq!(envelope.algorithm, Algorithm::XChaCha20Poly1305);
        assert_eq!(envelope.nonce.len(), 24);

        let plaintext = vault.decrypt_item(&id, &envelope).await.unwrap();
        assert_eq!(plaintext.as_bytes(), b"my secret note");

        let events = sink.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, AuditEvent::ItemEncrypted { item_id, .. } if item_id == "note/1")));
        assert!(events
            .iter()
            .any(|e| matches!(e, AuditEvent::DecryptAttempted { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, AuditEvent::DecryptFailed { .. })));
    }

    #[tokio::test]
    async fn test_envelope_bound_to_item_id() {
        let sink = Arc::new(MemoryAuditSink::new());
        let vault = VaultKeyHierarchy::builder(account("pw"))
            .audit(sink.clone())
            .build()
            .unwrap();
        vault.unlock(&"pw".into()).await.unwrap();

        let envelope = vault.encrypt_item(&item("a"), b"secret").await.unwrap();
        let err = vault.decrypt_item(&item("b"), &envelope).await.unwrap_err();

        assert!(matches!(err, Error::DecryptionFailed(_)));
        assert!(sink.events().iter().any(|e| matches!(
            e,
            AuditEvent::DecryptFailed {
                failure: FailureKind::Decryption,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_decrypt_while_locked() {
        let vault = VaultKeyHierarchy::new(account("pw")).unwrap();
        vault.unlock(&"pw".into()).await.unwrap();
        let envelope = vault.encrypt_item(&item("a"), b"secret").await.unwrap();
        vault.lock().await;

        assert!(matches!(
            vault.decrypt_item(&item("a"), &envelope).await,
            Err(Error::VaultLocked)
        ));
    }

    #[tokio::test]
    async fn test_expired_envelope_rejected() {
        let vault = VaultKeyHierarchy::builder(account("pw"))
            .max_envelope_age(Duration::from_secs(60))
            .build()
            .unwrap();
        vault.unlock(&"pw".into()).await.unwrap();

        let mut envelope = vault.encrypt_item(&item("a"), b"secret").await.unwrap();
        envelope.timestamp -= 120_000;

        let err = vault.decrypt_item(&item("a"), &envelope).await.unwrap_err();
        assert!(matches!(err, Error::DataExpired { .. }));
        assert_eq!(err.public_message(), "cannot decrypt");
    }

    #[tokio::test]
    async fn test_cipher_preference_is_forced() {
        let mut config = account("pw");
        config.cipher_preference = Some(Algorithm::Aes256Gcm);
        let vault = VaultKeyHierarchy::new(config).unwrap();

        assert_eq!(vault.algorithm(), Algorithm::Aes256Gcm);
        assert_eq!(
            vault.selection().reason,
            lockbox_crypto::SelectionReason::UserPreference
        );
    }

    #[tokio::test]
    async fn test_envelopes_from_other_cipher_still_open() {
        let config = account("pw");
        let xchacha = VaultKeyHierarchy::new(config.clone()).unwrap();
        xchacha.unlock(&"pw".into()).await.unwrap();
        let envelope = xchacha.encrypt_item(&item("a"), b"secret").await.unwrap();

        let mut aes_config = config;
        aes_config.cipher_preference = Some(Algorithm::Aes256Gcm);
        let aes = VaultKeyHierarchy::new(aes_config).unwrap();
        aes.unlock(&"pw".into()).await.unwrap();

        let plaintext = aes.decrypt_item(&item("a"), &envelope).await.unwrap();
        assert_eq!(plaintext.as_bytes(), b"secret");
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_lock_after_idle() {
        let sink = Arc::new(MemoryAuditSink::new());
        let vault = VaultKeyHierarchy::builder(account("pw"))
            .auto_lock(Duration::from_secs(60))
            .audit(sink.clone())
            .build()
            .unwrap();
        vault.unlock(&"pw".into()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        vault.derive_item_key(&item("a")).await.unwrap();

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(vault.state().await, LockState::Unlocked);

        tokio::time::sleep(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        assert_eq!(vault.state().await, LockState::Locked);
        assert!(sink.events().contains(&AuditEvent::Locked {
            reason: LockReason::Timeout
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_lock_stops_timer() {
        let sink = Arc::new(MemoryAuditSink::new());
        let vault = VaultKeyHierarchy::builder(account("pw"))
            .auto_lock(Duration::from_secs(10))
            .audit(sink.clone())
            .build()
            .unwrap();
        vault.unlock(&"pw".into()).await.unwrap();
        vault.lock().await;

        // Touching a locked vault must not re-arm the timer.
        let _ = vault.derive_item_key(&item("a")).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let locks: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, AuditEvent::Locked { .. }))
            .collect();
        assert_eq!(
            locks,
            vec![AuditEvent::Locked {
                reason: LockReason::Explicit
            }]
        );
    }

    /// Argon2id backend that blocks until released by the test.
    #[derive(Debug)]
    struct GatedBackend {
        started: StdMutex<Option<oneshot::Sender<()>>>,
        release: StdMutex<std::sync::mpsc::Receiver<()>>,
    }

    impl KdfBackend for GatedBackend {
        fn algorithm(&self) -> KdfAlgorithm {
            KdfAlgorithm::Argon2id
        }

        fn is_available(&self) -> bool {
            true
        }

        fn derive(&self, password: &[u8], salt: &[u8], params: &KdfParams, out: &mut [u8]) -> Result<()> {
            if let Some(started) = self.started.lock().unwrap().take() {
                let _ = started.send(());
            }
            let _ = self.release.lock().unwrap().recv();
            Argon2idBackend.derive(password, salt, params, out)
        }
    }

    #[tokio::test]
    async fn test_lock_cancels_unlock_in_flight() {
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let backend = GatedBackend {
            started: StdMutex::new(Some(started_tx)),
            release: StdMutex::new(release_rx),
        };
        let vault = VaultKeyHierarchy::builder(account("pw"))
            .kdf(KeyDerivationService::with_backend(Arc::new(backend)))
            .build()
            .unwrap();

        let unlocking = {
            let vault = vault.clone();
            tokio::spawn(async move { vault.unlock(&"pw".into()).await })
        };
        started_rx.await.unwrap();

        vault.lock().await;
        let result = unlocking.await.unwrap();
        release_tx.send(()).unwrap();

        assert!(matches!(result, Err(Error::Cancelled(_))));
        assert_eq!(vault.state().await, LockState::Locked);
    }

    #[tokio::test]
    async fn test_unlock_without_canary_is_unverified() {
        let mut config = account("pw");
        config.canary = None;
        let vault = VaultKeyHierarchy::new(config).unwrap();

        vault.unlock(&"other".into()).await.unwrap();
        assert_eq!(vault.state().await, LockState::Unlocked);
    }

    #[tokio::test]
    async fn test_unlock_reports_upgrade() {
        let vault = VaultKeyHierarchy::builder(account("pw"))
            .kdf_upgrade_target(KdfParams::interactive())
            .build()
            .unwrap();
        let report = vault.unlock(&"pw".into()).await.unwrap();

        assert_eq!(report.kdf_algorithm, KdfAlgorithm::Argon2id);
        assert!(report.kdf_upgrade_recommended);

        let vault = VaultKeyHierarchy::new(account("pw")).unwrap();
        let report = vault.unlock(&"pw".into()).await.unwrap();
        assert!(!report.kdf_upgrade_recommended);
    }

    #[tokio::test]
    async fn test_rotate_kdf() {
        let vault = VaultKeyHierarchy::new(account("pw")).unwrap();
        vault.unlock(&"pw".into()).await.unwrap();
        let id = item("login/bank");
        let envelope = vault.encrypt_item(&id, b"pin 1234").await.unwrap();
        let old_config = vault.account_config().await;

        let stronger = KdfParams {
            time_cost: 2,
            ..fast_params()
        };
        let rotation = vault.rotate_kdf(&"pw".into(), stronger).await.unwrap();
        let rotated = vault.reencrypt_item(&rotation, &id, &envelope).await.unwrap();
        let new_config = vault.commit_rotation(rotation).await.unwrap();

        assert_eq!(new_config.kdf_params, stronger);
        assert_ne!(new_config.salt, old_config.salt);
        assert_eq!(new_config.created_at, old_config.created_at);

        let plaintext = vault.decrypt_item(&id, &rotated).await.unwrap();
        assert_eq!(plaintext.as_bytes(), b"pin 1234");
        assert!(vault.decrypt_item(&id, &envelope).await.is_err());

        let reopened = VaultKeyHierarchy::new(new_config).unwrap();
        reopened.unlock(&"pw".into()).await.unwrap();
        assert!(reopened.decrypt_item(&id, &rotated).await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_discards_pending_rotation() {
        let vault = VaultKeyHierarchy::new(account("pw")).unwrap();
        vault.unlock(&"pw".into()).await.unwrap();
        let id = item("login/bank");
        let envelope = vault.encrypt_item(&id, b"pin 1234").await.unwrap();
        let rotation = vault.rotate_kdf(&"pw".into(), fast_params()).await.unwrap();

        vault.lock().await;
        assert!(matches!(
            vault.reencrypt_item(&rotation, &id, &envelope).await,
            Err(Error::VaultLocked)
        ));

        // Unlocking again does not revive the discarded key.
        vault.unlock(&"pw".into()).await.unwrap();
        assert!(matches!(
            vault.reencrypt_item(&rotation, &id, &envelope).await,
            Err(Error::Cancelled(_))
        ));
        assert!(matches!(
            vault.commit_rotation(rotation).await,
            Err(Error::Cancelled(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_lock_discards_pending_rotation() {
        let vault = VaultKeyHierarchy::builder(account("pw"))
            .auto_lock(Duration::from_secs(60))
            .build()
            .unwrap();
        vault.unlock(&"pw".into()).await.unwrap();
        let id = item("a");
        let envelope = vault.encrypt_item(&id, b"secret").await.unwrap();
        let rotation = vault.rotate_kdf(&"pw".into(), fast_params()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert_eq!(vault.state().await, LockState::Locked);
        assert!(matches!(
            vault.reencrypt_item(&rotation, &id, &envelope).await,
            Err(Error::VaultLocked)
        ));
    }

    #[tokio::test]
    async fn test_newer_rotation_replaces_pending() {
        let vault = VaultKeyHierarchy::new(account("pw")).unwrap();
        vault.unlock(&"pw".into()).await.unwrap();
        let id = item("a");
        let envelope = vault.encrypt_item(&id, b"secret").await.unwrap();

        let first = vault.rotate_kdf(&"pw".into(), fast_params()).await.unwrap();
        let second = vault.rotate_kdf(&"pw".into(), fast_params()).await.unwrap();

        assert!(matches!(
            vault.reencrypt_item(&first, &id, &envelope).await,
            Err(Error::Cancelled(_))
        ));
        let rotated = vault.reencrypt_item(&second, &id, &envelope).await.unwrap();
        vault.commit_rotation(second).await.unwrap();
        assert_eq!(
            vault.decrypt_item(&id, &rotated).await.unwrap().as_bytes(),
            b"secret"
        );
    }

    #[tokio::test]
    async fn test_rotate_kdf_rejects_wrong_password() {
        let vault = VaultKeyHierarchy::new(account("pw")).unwrap();
        vault.unlock(&"pw".into()).await.unwrap();

        assert!(matches!(
            vault.rotate_kdf(&"nope".into(), fast_params()).await,
            Err(Error::DecryptionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_rotation_not_committed() {
        let vault = VaultKeyHierarchy::new(account("pw")).unwrap();
        vault.unlock(&"pw".into()).await.unwrap();
        let rotation = vault.rotate_kdf(&"pw".into(), fast_params()).await.unwrap();

        vault.lock().await;
        vault.unlock(&"pw".into()).await.unwrap();

        assert!(matches!(
            vault.commit_rotation(rotation).await,
            Err(Error::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_rotate_requires_unlock() {
        let vault = VaultKeyHierarchy::new(account("pw")).unwrap();
        assert!(matches!(
            vault.rotate_kdf(&"pw".into(), fast_params()).await,
            Err(Error::VaultLocked)
        ));
    }

    #[test]
    fn test_build_rejects_mismatched_kdf() {
        let result = VaultKeyHierarchy::builder(account("pw"))
            .kdf(KeyDerivationService::with_backend(Arc::new(
                lockbox_crypto::Pbkdf2Backend,
            )))
            .build();
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_debug_redacts_keys() {
        let vault = VaultKeyHierarchy::new(account("pw")).unwrap();
        let debug = format!("{:?}", vault);
        assert!(debug.contains("[REDACTED]"));
    }
}
