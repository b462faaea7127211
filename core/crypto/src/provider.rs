//! Crypto backend capability interface.
//!
//! Engine code asks a [`CryptoProvider`] for a cipher by algorithm and never
//! inspects which backend answers. The provider is chosen once, when the
//! selector and vault are built.

use chacha20poly1305::aead::OsRng;
use rand::RngCore;
use std::fmt;

use crate::aead::{AeadCipher, AesGcmCipher, Algorithm, XChaChaCipher};
use lockbox_common::{Error, Result};

/// Source of ciphers and randomness.
pub trait CryptoProvider: Send + Sync + fmt::Debug {
    /// Backend name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Whether `algorithm` is available from this backend.
    fn supports(&self, algorithm: Algorithm) -> bool;

    /// Cipher implementing `algorithm`.
    ///
    /// # Errors
    /// - `AlgorithmNotSupported` if the backend lacks it
    fn cipher(&self, algorithm: Algorithm) -> Result<&dyn AeadCipher>;

    /// Fill `buf` from a cryptographically secure RNG.
    fn fill_random(&self, buf: &mut [u8]) -> Result<()>;
}

/// Pure-Rust backend over the RustCrypto AEAD crates.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustCryptoProvider {
    aes: AesGcmCipher,
    xchacha: XChaChaCipher,
}

impl RustCryptoProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CryptoProvider for RustCryptoProvider {
    fn name(&self) -> &'static str {
        "rustcrypto"
    }

    fn supports(&self, _algorithm: Algorithm) -> bool {
        true
    }

    fn cipher(&self, algorithm: Algorithm) -> Result<&dyn AeadCipher> {
        match algorithm {
            Algorithm::Aes256Gcm => Ok(&self.aes),
            Algorithm::XChaCha20Poly1305 => Ok(&self.xchacha),
        }
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| Error::EncryptionFailed(format!("System RNG unavailable: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead::EncryptContext;

    /// Backend exposing only XChaCha20-Poly1305.
    #[derive(Debug, Default)]
    struct SoftwareOnly {
        xchacha: XChaChaCipher,
    }

    impl CryptoProvider for SoftwareOnly {
        fn name(&self) -> &'static str {
            "software-only"
        }

        fn supports(&self, algorithm: Algorithm) -> bool {
            algorithm == Algorithm::XChaCha20Poly1305
        }

        fn cipher(&self, algorithm: Algorithm) -> Result<&dyn AeadCipher> {
            match algorithm {
                Algorithm::XChaCha20Poly1305 => Ok(&self.xchacha),
                other => Err(Error::AlgorithmNotSupported(other.to_string())),
            }
        }

        fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
            RustCryptoProvider::new().fill_random(buf)
        }
    }

    #[test]
    fn test_provider_returns_matching_cipher() {
        let provider = RustCryptoProvider::new();
        for algorithm in Algorithm::ALL {
            assert!(provider.supports(algorithm));
            assert_eq!(provider.cipher(algorithm).unwrap().algorithm(), algorithm);
        }
    }

    #[test]
    fn test_missing_algorithm_is_reported() {
        let provider = SoftwareOnly::default();
        assert!(matches!(
            provider.cipher(Algorithm::Aes256Gcm),
            Err(Error::AlgorithmNotSupported(_))
        ));

        let cipher = provider.cipher(Algorithm::XChaCha20Poly1305).unwrap();
        let envelope = cipher
            .encrypt(b"via trait object", &[1u8; 32], &EncryptContext::default())
            .unwrap();
        assert_eq!(envelope.algorithm, Algorithm::XChaCha20Poly1305);
    }

    #[test]
    fn test_fill_random() {
        let provider = RustCryptoProvider::new();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        provider.fill_random(&mut a).unwrap();
        provider.fill_random(&mut b).unwrap();
        assert_ne!(a, b);
    }
}
