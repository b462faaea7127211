//! Run-time choice between AES-256-GCM and XChaCha20-Poly1305.
//!
//! Detection times a fixed batch of AES-256-GCM encryptions and compares it
//! to a threshold. The threshold depends on the machine and build profile,
//! so it is a tunable in [`SelectorConfig`]; unusual hardware (throttled
//! CPUs, emulators, debug builds) can be misclassified. A wrong guess only
//! costs speed: envelopes record the algorithm actually used.
//!
//! All memoized state lives in the selector instance. Nothing is global.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::aead::{Algorithm, EncryptContext};
use crate::keys::KEY_LENGTH;
use crate::provider::CryptoProvider;
use lockbox_common::{Error, Result};

/// Tunables for detection and benchmarking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Encryptions in the hardware probe.
    pub probe_iterations: u32,
    /// Plaintext size for each probe encryption.
    pub probe_buffer_size: usize,
    /// Probe batches faster than this count as hardware accelerated.
    pub hardware_threshold: Duration,
    /// Encryptions per benchmark run.
    pub benchmark_iterations: u32,
    /// Plaintext size for each benchmark encryption.
    pub benchmark_buffer_size: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            probe_iterations: 1000,
            probe_buffer_size: 1024,
            hardware_threshold: Duration::from_millis(5),
            benchmark_iterations: 200,
            benchmark_buffer_size: 4096,
        }
    }
}

/// Why an algorithm was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionReason {
    HardwareAcceleration,
    SoftwareFallback,
    UserPreference,
}

/// A recommendation. Envelopes still record what was actually used.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmSelection {
    pub algorithm: Algorithm,
    pub reason: SelectionReason,
    pub hardware_accelerated: bool,
    /// Encryptions per second, from the memoized benchmark.
    pub performance_score: f64,
}

#[derive(Debug, Default)]
struct SelectorState {
    hardware_accelerated: Option<bool>,
    scores: HashMap<Algorithm, f64>,
}

/// Detects hardware acceleration and recommends a cipher.
#[derive(Debug)]
pub struct AlgorithmSelector {
    provider: Arc<dyn CryptoProvider>,
    config: SelectorConfig,
    state: Mutex<SelectorState>,
}

impl AlgorithmSelector {
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self::with_config(provider, SelectorConfig::default())
    }

    pub fn with_config(provider: Arc<dyn CryptoProvider>, config: SelectorConfig) -> Self {
        Self {
            provider,
            config,
            state: Mutex::new(SelectorState::default()),
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, SelectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether AES-256-GCM runs fast enough to assume AES instructions.
    ///
    /// Times a batch of encryptions on first call; later calls return the
    /// memoized answer until [`clear_cache`](Self::clear_cache). The state
    /// lock is not held while timing, so concurrent first calls may each
    /// run the batch; the first stored answer wins.
    pub fn detect_hardware_acceleration(&self) -> bool {
        if let Some(detected) = self.state().hardware_accelerated {
            return detected;
        }

        let detected = match self.time_batch(
            Algorithm::Aes256Gcm,
            self.config.probe_iterations,
            self.config.probe_buffer_size,
        ) {
            Ok(elapsed) => {
                let fast = elapsed < self.config.hardware_threshold;
                debug!(
                    elapsed_us = elapsed.as_micros() as u64,
                    threshold_us = self.config.hardware_threshold.as_micros() as u64,
                    accelerated = fast,
                    "Hardware acceleration check finished"
                );
                fast
            }
            Err(e) => {
                warn!("Hardware acceleration check failed: {}", e);
                false
            }
        };

        *self.state().hardware_accelerated.get_or_insert(detected)
    }

    /// Recommend a cipher for this machine.
    ///
    /// # Errors
    /// - `AlgorithmNotSupported` if the provider lacks the chosen cipher
    pub fn select_optimal_algorithm(&self) -> Result<AlgorithmSelection> {
        let aes_available = self.provider.supports(Algorithm::Aes256Gcm);
        let (algorithm, reason) = if aes_available && self.detect_hardware_acceleration() {
            (Algorithm::Aes256Gcm, SelectionReason::HardwareAcceleration)
        } else {
            (Algorithm::XChaCha20Poly1305, SelectionReason::SoftwareFallback)
        };

        let performance_score = self.benchmark_algorithm(algorithm)?;
        info!(%algorithm, ?reason, performance_score, "Selected cipher");

        Ok(AlgorithmSelection {
            algorithm,
            reason,
            hardware_accelerated: reason == SelectionReason::HardwareAcceleration,
            performance_score,
        })
    }

    /// Use `algorithm` regardless of detection.
    ///
    /// # Errors
    /// - `AlgorithmNotSupported` if the provider lacks it
    pub fn force_algorithm(&self, algorithm: Algorithm) -> Result<AlgorithmSelection> {
        let performance_score = self.benchmark_algorithm(algorithm)?;
        Ok(AlgorithmSelection {
            algorithm,
            reason: SelectionReason::UserPreference,
            hardware_accelerated: algorithm == Algorithm::Aes256Gcm,
            performance_score,
        })
    }

    /// Encryptions per second for `algorithm`, memoized.
    ///
    /// Failed runs are not memoized and may simply be retried.
    pub fn benchmark_algorithm(&self, algorithm: Algorithm) -> Result<f64> {
        if let Some(score) = self.state().scores.get(&algorithm) {
            return Ok(*score);
        }

        let iterations = self.config.benchmark_iterations.max(1);
        let elapsed = self.time_batch(algorithm, iterations, self.config.benchmark_buffer_size)?;
        let score = f64::from(iterations) / elapsed.as_secs_f64().max(f64::EPSILON);

        debug!(%algorithm, score, "Benchmarked cipher");
        Ok(*self.state().scores.entry(algorithm).or_insert(score))
    }

    /// Forget detection and benchmark results.
    pub fn clear_cache(&self) {
        let mut state = self.state();
        state.hardware_accelerated = None;
        state.scores.clear();
    }

    fn time_batch(&self, algorithm: Algorithm, iterations: u32, buffer_size: usize) -> Result<Duration> {
        let cipher = self.provider.cipher(algorithm)?;

        let mut key = [0u8; KEY_LENGTH];
        self.provider.fill_random(&mut key)?;
        let mut buffer = vec![0u8; buffer_size.max(1)];
        self.provider.fill_random(&mut buffer)?;

        let context = EncryptContext::default();
        let start = Instant::now();
        for _ in 0..iterations {
            cipher
                .encrypt(&buffer, &key, &context)
                .map_err(|e| Error::EncryptionFailed(format!("Benchmark of {} failed: {}", algorithm, e)))?;
        }
        Ok(start.elapsed())
    }
}
