//! Cryptographic primitives for Lockbox.
//!
//! This module provides:
//! - Password-based key derivation (Argon2id, PBKDF2-HMAC-SHA256 fallback)
//! - Per-item key derivation with HKDF-SHA256
//! - Authenticated encryption with AES-256-GCM or XChaCha20-Poly1305
//! - Run-time cipher selection
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Envelopes carry the algorithm that produced them; decryption never
//!   falls back to another cipher

pub mod aead;
pub mod envelope;
pub mod kdf;
pub mod keys;
pub mod provider;
pub mod selector;

mod encoding;

pub use aead::{
    AeadCipher, AesGcmCipher, Algorithm, DecryptContext, EncryptContext, XChaChaCipher, TAG_SIZE,
};
pub use envelope::EncryptionEnvelope;
pub use kdf::{
    Argon2idBackend, KdfAlgorithm, KdfBackend, KdfParams, KeyDerivationResult,
    KeyDerivationService, Pbkdf2Backend, SecurityLevel,
};
pub use keys::{DerivedKey, ItemKey, MasterKey, Salt, KEY_LENGTH};
pub use provider::{CryptoProvider, RustCryptoProvider};
pub use selector::{AlgorithmSelection, AlgorithmSelector, SelectionReason, SelectorConfig};
