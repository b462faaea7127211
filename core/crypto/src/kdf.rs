//! Password-based key derivation.
//!
//! Argon2id is the primary strategy: a memory-hard function resistant to
//! GPU and time-memory trade-off attacks. PBKDF2-HMAC-SHA256 is kept as a
//! fallback strategy for runtimes where Argon2id cannot run. The strategy is
//! picked once when the service is built and recorded with every result.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::keys::{check_salt_length, DerivedKey, Salt, DEFAULT_SALT_LENGTH};
use lockbox_common::{Error, Password, Result};

pub const MIN_TIME_COST: u32 = 1;
pub const MAX_TIME_COST: u32 = 10;
pub const MIN_MEMORY_COST: u32 = 8192;
pub const MAX_MEMORY_COST: u32 = 1_048_576;
pub const MIN_PARALLELISM: u32 = 1;
pub const MAX_PARALLELISM: u32 = 16;
pub const MIN_OUTPUT_LENGTH: usize = 16;
pub const MAX_OUTPUT_LENGTH: usize = 64;

/// Floor on PBKDF2 iterations.
pub const PBKDF2_MIN_ITERATIONS: u32 = 600_000;

/// PBKDF2 iterations charged per unit of Argon2 time cost.
///
/// Inherited formula: `max(600_000, time * 200_000)`. It compensates for
/// PBKDF2 having no memory hardness; the multiplier has no derivation of
/// its own.
pub const PBKDF2_ITERATIONS_PER_TIME_COST: u32 = 200_000;

// Heuristic throughput figures for `estimate_derivation_time`.
const ARGON2_MS_PER_MIB_PASS: f64 = 1.0;
const PBKDF2_ITERATIONS_PER_MS: f64 = 1_000.0;

/// Cost parameters for password-based key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Number of passes (Argon2 `t`).
    pub time_cost: u32,
    /// Memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory_cost: u32,
    /// Degree of parallelism (Argon2 lanes).
    pub parallelism: u32,
    /// Length of the derived key in bytes.
    pub output_length: usize,
}

impl KdfParams {
    /// Parameters suitable for interactive unlocks.
    ///
    /// Targets a few hundred milliseconds on a typical laptop.
    pub fn interactive() -> Self {
        Self {
            time_cost: 2,
            memory_cost: 19456, // 19 MiB
            parallelism: 1,
            output_length: 32,
        }
    }

    /// Higher cost for accounts holding sensitive data.
    pub fn sensitive() -> Self {
        Self {
            time_cost: 3,
            memory_cost: 65536, // 64 MiB
            parallelism: 4,
            output_length: 32,
        }
    }

    /// Maximum brute-force resistance; derivation takes seconds.
    pub fn paranoid() -> Self {
        Self {
            time_cost: 4,
            memory_cost: 262144, // 256 MiB
            parallelism: 4,
            output_length: 32,
        }
    }

    /// Check every cost parameter against its bounds.
    ///
    /// Out-of-range values are rejected, never clamped.
    pub fn validate(&self) -> Result<()> {
        check_range("time cost", self.time_cost, MIN_TIME_COST, MAX_TIME_COST)?;
        check_range(
            "memory cost",
            self.memory_cost,
            MIN_MEMORY_COST,
            MAX_MEMORY_COST,
        )?;
        check_range(
            "parallelism",
            self.parallelism,
            MIN_PARALLELISM,
            MAX_PARALLELISM,
        )?;
        check_range(
            "output length",
            self.output_length,
            MIN_OUTPUT_LENGTH,
            MAX_OUTPUT_LENGTH,
        )?;
        Ok(())
    }

    /// Iteration count used when these parameters run through PBKDF2.
    pub fn pbkdf2_iterations(&self) -> u32 {
        PBKDF2_MIN_ITERATIONS.max(self.time_cost.saturating_mul(PBKDF2_ITERATIONS_PER_TIME_COST))
    }

    /// Whether any cost is lower than in `target`.
    pub fn is_weaker_than(&self, target: &KdfParams) -> bool {
        self.time_cost < target.time_cost
            || self.memory_cost < target.memory_cost
            || self.parallelism < target.parallelism
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

fn check_range<T: PartialOrd + fmt::Display>(name: &str, value: T, min: T, max: T) -> Result<()> {
    if value < min || value > max {
        return Err(Error::InvalidParameter(format!(
            "{} must be between {} and {}, got {}",
            name, min, max, value
        )));
    }
    Ok(())
}

/// Preset cost levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Interactive,
    Sensitive,
    Paranoid,
}

impl FromStr for SecurityLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "interactive" => Ok(Self::Interactive),
            "sensitive" => Ok(Self::Sensitive),
            "paranoid" => Ok(Self::Paranoid),
            other => Err(Error::InvalidParameter(format!(
                "Unknown security level '{}': use interactive, sensitive or paranoid",
                other
            ))),
        }
    }
}

/// Key derivation function actually used to produce a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KdfAlgorithm {
    #[serde(rename = "argon2id")]
    Argon2id,
    #[serde(rename = "pbkdf2-hmac-sha256")]
    Pbkdf2HmacSha256,
}

impl fmt::Display for KdfAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KdfAlgorithm::Argon2id => write!(f, "argon2id"),
            KdfAlgorithm::Pbkdf2HmacSha256 => write!(f, "pbkdf2-hmac-sha256"),
        }
    }
}

/// A key derivation strategy.
///
/// Implementations fill `out` completely or fail; inputs are already
/// validated by [`KeyDerivationService`].
pub trait KdfBackend: Send + Sync + fmt::Debug {
    /// Algorithm this backend implements.
    fn algorithm(&self) -> KdfAlgorithm;

    /// Whether the primitive works in this runtime.
    fn is_available(&self) -> bool;

    /// Derive `out.len()` bytes from the password and salt.
    fn derive(&self, password: &[u8], salt: &[u8], params: &KdfParams, out: &mut [u8])
        -> Result<()>;
}

/// Argon2id (v0x13).
#[derive(Debug, Default, Clone, Copy)]
pub struct Argon2idBackend;

impl KdfBackend for Argon2idBackend {
    fn algorithm(&self) -> KdfAlgorithm {
        KdfAlgorithm::Argon2id
    }

    fn is_available(&self) -> bool {
        // Smallest legal instance; failure means the primitive is unusable here.
        let mut probe = [0u8; 32];
        Params::new(8, 1, 1, Some(probe.len()))
            .map(|params| Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
            .and_then(|argon2| argon2.hash_password_into(b"probe", b"lockbox-probe-salt", &mut probe))
            .is_ok()
    }

    fn derive(
        &self,
        password: &[u8],
        salt: &[u8],
        params: &KdfParams,
        out: &mut [u8],
    ) -> Result<()> {
        let argon2_params = Params::new(
            params.memory_cost,
            params.time_cost,
            params.parallelism,
            Some(out.len()),
        )
        .map_err(|e| Error::KeyDerivationFailed(format!("Invalid Argon2id parameters: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);
        argon2
            .hash_password_into(password, salt, out)
            .map_err(|e| Error::KeyDerivationFailed(format!("Argon2id failed: {}", e)))
    }
}

/// PBKDF2-HMAC-SHA256 with `max(600_000, time * 200_000)` iterations.
///
/// Memory and parallelism are validated but have no effect.
#[derive(Debug, Default, Clone, Copy)]
pub struct Pbkdf2Backend;

impl KdfBackend for Pbkdf2Backend {
    fn algorithm(&self) -> KdfAlgorithm {
        KdfAlgorithm::Pbkdf2HmacSha256
    }

    fn is_available(&self) -> bool {
        true
    }

    fn derive(
        &self,
        password: &[u8],
        salt: &[u8],
        params: &KdfParams,
        out: &mut [u8],
    ) -> Result<()> {
        pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, params.pbkdf2_iterations(), out);
        Ok(())
    }
}

/// Output of a successful derivation.
#[derive(Debug)]
pub struct KeyDerivationResult {
    /// Derived key, exactly `params.output_length` bytes.
    pub key: DerivedKey,
    /// Parameters used.
    pub params: KdfParams,
    /// Strategy used.
    pub algorithm: KdfAlgorithm,
    /// Wall-clock time spent in the primitive. Diagnostics only.
    pub derivation_time: Duration,
}

impl KeyDerivationResult {
    pub fn derivation_time_ms(&self) -> u128 {
        self.derivation_time.as_millis()
    }
}

/// Derives keys from passwords with one strategy chosen at construction.
#[derive(Debug, Clone)]
pub struct KeyDerivationService {
    backend: Arc<dyn KdfBackend>,
}

impl KeyDerivationService {
    /// Pick Argon2id if it works in this runtime, PBKDF2 otherwise.
    pub fn probe() -> Self {
        Self::probe_from(Arc::new(Argon2idBackend), Arc::new(Pbkdf2Backend))
    }

    /// Use `primary` if it reports itself available, `fallback` otherwise.
    pub fn probe_from(primary: Arc<dyn KdfBackend>, fallback: Arc<dyn KdfBackend>) -> Self {
        if primary.is_available() {
            Self::with_backend(primary)
        } else {
            warn!(
                unavailable = %primary.algorithm(),
                fallback = %fallback.algorithm(),
                "KDF unavailable, falling back"
            );
            Self::with_backend(fallback)
        }
    }

    /// Use a specific backend.
    pub fn with_backend(backend: Arc<dyn KdfBackend>) -> Self {
        Self { backend }
    }

    /// Build a service for a recorded algorithm.
    ///
    /// Accounts must be unlocked with the KDF that created them.
    ///
    /// # Errors
    /// - `AlgorithmNotSupported` if that KDF cannot run here
    pub fn for_algorithm(algorithm: KdfAlgorithm) -> Result<Self> {
        let backend: Arc<dyn KdfBackend> = match algorithm {
            KdfAlgorithm::Argon2id => Arc::new(Argon2idBackend),
            KdfAlgorithm::Pbkdf2HmacSha256 => Arc::new(Pbkdf2Backend),
        };
        if !backend.is_available() {
            return Err(Error::AlgorithmNotSupported(format!(
                "{} is not available in this runtime",
                algorithm
            )));
        }
        Ok(Self::with_backend(backend))
    }

    /// Algorithm of the active strategy.
    pub fn algorithm(&self) -> KdfAlgorithm {
        self.backend.algorithm()
    }

    /// Derive a key from a password and salt.
    ///
    /// # Preconditions
    /// - password is 1..=4096 characters
    /// - salt is 16..=64 bytes
    /// - params are within bounds (see [`KdfParams::validate`])
    ///
    /// # Postconditions
    /// - The key is exactly `params.output_length` bytes
    /// - Identical inputs always yield the identical key
    ///
    /// # Errors
    /// - `InvalidParameter` for any bound violation; the primitive is not run
    /// - `KeyDerivationFailed` if the primitive fails
    ///
    /// # Security
    /// - Password is not stored or logged
    /// - Output buffer is zeroized if derivation fails
    pub fn derive_key(
        &self,
        password: &Password,
        salt: &[u8],
        params: &KdfParams,
    ) -> Result<KeyDerivationResult> {
        password.validate()?;
        check_salt_length(salt.len())?;
        params.validate()?;

        let start = Instant::now();
        let mut key = DerivedKey::from_vec(vec![0u8; params.output_length]);
        self.backend
            .derive(password.as_bytes(), salt, params, key.as_mut_bytes())?;
        let derivation_time = start.elapsed();

        if key.len() != params.output_length {
            return Err(Error::KeyDerivationFailed(format!(
                "Derived {} bytes, expected {}",
                key.len(),
                params.output_length
            )));
        }

        debug!(
            algorithm = %self.backend.algorithm(),
            time_cost = params.time_cost,
            memory_cost = params.memory_cost,
            elapsed_ms = derivation_time.as_millis() as u64,
            "Derived key"
        );

        Ok(KeyDerivationResult {
            key,
            params: *params,
            algorithm: self.backend.algorithm(),
            derivation_time,
        })
    }

    /// Generate a random salt of `length` bytes.
    ///
    /// # Errors
    /// - `InvalidParameter` if length is outside 16..=64
    pub fn generate_salt(length: usize) -> Result<Salt> {
        Salt::generate(length)
    }

    /// Generate a salt of the default length (32 bytes).
    pub fn generate_default_salt() -> Result<Salt> {
        Salt::generate(DEFAULT_SALT_LENGTH)
    }

    /// Preset parameters for a security level.
    ///
    /// Advisory only; the service does not enforce a minimum level.
    pub fn recommended_params(level: SecurityLevel) -> KdfParams {
        match level {
            SecurityLevel::Interactive => KdfParams::interactive(),
            SecurityLevel::Sensitive => KdfParams::sensitive(),
            SecurityLevel::Paranoid => KdfParams::paranoid(),
        }
    }

    /// Reject degenerate KDF output.
    ///
    /// An empty key or one whose bytes are all identical indicates a broken
    /// primitive. This is a sanity check, not a proof of quality.
    pub fn validate_derived_key(key: &[u8]) -> Result<()> {
        let Some(first) = key.first() else {
            return Err(Error::KeyDerivationFailed("Derived key is empty".to_string()));
        };
        if key.iter().all(|b| b == first) {
            return Err(Error::KeyDerivationFailed(
                "Derived key is degenerate".to_string(),
            ));
        }
        Ok(())
    }

    /// Rough duration of a derivation with `params`, without running it.
    pub fn estimate_derivation_time(&self, params: &KdfParams) -> Duration {
        let ms = match self.backend.algorithm() {
            KdfAlgorithm::Argon2id => {
                let mib = f64::from(params.memory_cost) / 1024.0;
                mib * f64::from(params.time_cost) * ARGON2_MS_PER_MIB_PASS
            }
            KdfAlgorithm::Pbkdf2HmacSha256 => {
                f64::from(params.pbkdf2_iterations()) / PBKDF2_ITERATIONS_PER_MS
            }
        };
        Duration::from_millis(ms.round() as u64)
    }
}

impl Default for KeyDerivationService {
    fn default() -> Self {
        Self::probe()
    }
}
