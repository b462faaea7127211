//! Authenticated encryption with two interchangeable ciphers.
//!
//! AES-256-GCM (12-byte nonce) is the fast path on CPUs with AES
//! instructions; XChaCha20-Poly1305 (24-byte nonce) is the software path and
//! makes random nonces safe at high volume. Both use 32-byte keys and
//! 16-byte tags, so an [`EncryptionEnvelope`] differs only in its algorithm
//! tag and nonce length.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, Nonce, OsRng, Payload},
    XChaCha20Poly1305,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::envelope::{now_millis, EncryptionEnvelope};
use crate::keys::KEY_LENGTH;
use lockbox_common::{Error, Result};

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Nonce size for AES-256-GCM (12 bytes).
pub const AES_GCM_NONCE_SIZE: usize = 12;

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// AEAD construction recorded in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    #[serde(rename = "XChaCha20-Poly1305")]
    XChaCha20Poly1305,
}

impl Algorithm {
    /// Every supported algorithm.
    pub const ALL: [Algorithm; 2] = [Algorithm::Aes256Gcm, Algorithm::XChaCha20Poly1305];

    /// Nonce length this construction requires.
    pub fn nonce_size(&self) -> usize {
        match self {
            Algorithm::Aes256Gcm => AES_GCM_NONCE_SIZE,
            Algorithm::XChaCha20Poly1305 => XCHACHA_NONCE_SIZE,
        }
    }

    /// Canonical name, as persisted.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "AES-256-GCM",
            Algorithm::XChaCha20Poly1305 => "XChaCha20-Poly1305",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aes-256-gcm" | "aes256gcm" | "aes" => Ok(Algorithm::Aes256Gcm),
            "xchacha20-poly1305" | "xchacha20poly1305" | "xchacha" => {
                Ok(Algorithm::XChaCha20Poly1305)
            }
            _ => Err(Error::AlgorithmNotSupported(s.to_string())),
        }
    }
}

/// Options for [`AeadCipher::encrypt`].
#[derive(Debug, Clone, Default)]
pub struct EncryptContext {
    /// Authenticated but not encrypted (e.g. the item id).
    pub additional_data: Option<Vec<u8>>,
}

impl EncryptContext {
    pub fn with_additional_data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            additional_data: Some(data.into()),
        }
    }
}

/// Options for [`AeadCipher::decrypt`].
#[derive(Debug, Clone, Default)]
pub struct DecryptContext {
    /// Reject envelopes older than this, before any cryptography runs.
    pub max_age: Option<Duration>,
    /// Must equal the associated data used at encryption time.
    pub verify_additional_data: Option<Vec<u8>>,
}

impl DecryptContext {
    pub fn with_additional_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.verify_additional_data = Some(data.into());
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }
}

/// Contract shared by both ciphers.
///
/// Implementors supply the raw primitive (`seal`/`open`); boundary checks,
/// envelope assembly and the algorithm binding are provided here so both
/// ciphers enforce them identically.
pub trait AeadCipher: Send + Sync + fmt::Debug {
    /// Algorithm this implementation embodies.
    fn algorithm(&self) -> Algorithm;

    /// Encrypt under a fresh random nonce. Returns `(nonce, ciphertext || tag)`.
    fn seal(&self, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Verify and decrypt `ciphertext || tag`.
    fn open(&self, key: &[u8], nonce: &[u8], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    fn nonce_size(&self) -> usize {
        self.algorithm().nonce_size()
    }

    /// Encrypt plaintext into an envelope.
    ///
    /// # Preconditions
    /// - `key` must be exactly KEY_LENGTH bytes
    /// - `plaintext` must not be empty
    ///
    /// # Postconditions
    /// - `ciphertext.len() == plaintext.len()`, `auth_tag.len() == TAG_SIZE`
    /// - The nonce is freshly generated for this call
    ///
    /// # Errors
    /// - `InvalidKeyLength`, `InvalidDataSize`, `EncryptionFailed`
    fn encrypt(
        &self,
        plaintext: &[u8],
        key: &[u8],
        context: &EncryptContext,
    ) -> Result<EncryptionEnvelope> {
        self.validate_key(key)?;
        if plaintext.is_empty() {
            return Err(Error::InvalidDataSize(
                "Plaintext cannot be empty".to_string(),
            ));
        }

        let aad = context.additional_data.as_deref().unwrap_or_default();
        let (nonce, mut ciphertext) = self.seal(key, plaintext, aad)?;

        if ciphertext.len() != plaintext.len() + TAG_SIZE {
            return Err(Error::EncryptionFailed(format!(
                "Unexpected sealed length {} for {} bytes of plaintext",
                ciphertext.len(),
                plaintext.len()
            )));
        }
        let auth_tag = ciphertext.split_off(plaintext.len());

        Ok(EncryptionEnvelope {
            algorithm: self.algorithm(),
            nonce,
            ciphertext,
            auth_tag,
            timestamp: now_millis(),
        })
    }

    /// Decrypt an envelope produced by this algorithm.
    ///
    /// # Errors
    /// - `InvalidKeyLength` if the key is not KEY_LENGTH bytes
    /// - `AlgorithmNotSupported` if the envelope records another algorithm
    /// - `DataExpired` if older than `context.max_age` (checked before crypto)
    /// - `InvalidDataSize` for malformed nonce, tag or ciphertext
    /// - `DecryptionFailed` on any authentication failure
    ///
    /// # Security
    /// - No plaintext is returned unless the tag verifies
    fn decrypt(
        &self,
        envelope: &EncryptionEnvelope,
        key: &[u8],
        context: &DecryptContext,
    ) -> Result<Vec<u8>> {
        self.validate_key(key)?;

        if envelope.algorithm != self.algorithm() {
            return Err(Error::AlgorithmNotSupported(format!(
                "Envelope sealed with {}, cipher is {}",
                envelope.algorithm,
                self.algorithm()
            )));
        }

        if let Some(max_age) = context.max_age {
            let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
            let age_ms = envelope.age_ms(now_millis());
            if age_ms > max_age_ms {
                return Err(Error::DataExpired { age_ms, max_age_ms });
            }
        }

        self.validate_nonce(&envelope.nonce)?;
        if envelope.auth_tag.len() != TAG_SIZE {
            return Err(Error::InvalidDataSize(format!(
                "Authentication tag must be {} bytes, got {}",
                TAG_SIZE,
                envelope.auth_tag.len()
            )));
        }
        if envelope.ciphertext.is_empty() {
            return Err(Error::InvalidDataSize("Ciphertext is empty".to_string()));
        }

        let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(&envelope.ciphertext);
        sealed.extend_from_slice(&envelope.auth_tag);

        let aad = context.verify_additional_data.as_deref().unwrap_or_default();
        self.open(key, &envelope.nonce, &sealed, aad)
    }

    /// Generate a random 256-bit key.
    fn generate_key(&self) -> Zeroizing<[u8; KEY_LENGTH]> {
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        OsRng.fill_bytes(&mut key[..]);
        key
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != KEY_LENGTH {
            return Err(Error::InvalidKeyLength {
                expected: KEY_LENGTH,
                actual: key.len(),
            });
        }
        Ok(())
    }

    fn validate_nonce(&self, nonce: &[u8]) -> Result<()> {
        if nonce.len() != self.nonce_size() {
            return Err(Error::InvalidDataSize(format!(
                "{} nonce must be {} bytes, got {}",
                self.algorithm(),
                self.nonce_size(),
                nonce.len()
            )));
        }
        Ok(())
    }
}

fn seal_with<C>(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>)>
where
    C: Aead + AeadCore + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| Error::InvalidKeyLength {
        expected: KEY_LENGTH,
        actual: key.len(),
    })?;
    let nonce = C::generate_nonce(&mut OsRng);

    let sealed = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| Error::EncryptionFailed(e.to_string()))?;

    Ok((nonce.to_vec(), sealed))
}

fn open_with<C>(key: &[u8], nonce: &[u8], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>>
where
    C: Aead + AeadCore + KeyInit,
{
    let cipher = C::new_from_slice(key).map_err(|_| Error::InvalidKeyLength {
        expected: KEY_LENGTH,
        actual: key.len(),
    })?;
    let nonce = Nonce::<C>::from_slice(nonce);

    cipher
        .decrypt(nonce, Payload { msg: sealed, aad })
        .map_err(|_| Error::DecryptionFailed("Authentication tag mismatch".to_string()))
}

/// AES-256-GCM, the hardware-accelerated path.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmCipher;

impl AeadCipher for AesGcmCipher {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Aes256Gcm
    }

    fn seal(&self, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        seal_with::<Aes256Gcm>(key, plaintext, aad)
    }

    fn open(&self, key: &[u8], nonce: &[u8], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.validate_nonce(nonce)?;
        open_with::<Aes256Gcm>(key, nonce, sealed, aad)
    }
}

/// XChaCha20-Poly1305, the software path.
#[derive(Debug, Default, Clone, Copy)]
pub struct XChaChaCipher;

impl AeadCipher for XChaChaCipher {
    fn algorithm(&self) -> Algorithm {
        Algorithm::XChaCha20Poly1305
    }

    fn seal(&self, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        seal_with::<XChaCha20Poly1305>(key, plaintext, aad)
    }

    fn open(&self, key: &[u8], nonce: &[u8], sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.validate_nonce(nonce)?;
        open_with::<XChaCha20Poly1305>(key, nonce, sealed, aad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ciphers() -> [Box<dyn AeadCipher>; 2] {
        [Box::new(AesGcmCipher), Box::new(XChaChaCipher)]
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        OsRng.fill_bytes(&mut bytes);
        bytes
    }

    #[test]
    fn test_aes_gcm_1024_byte_scenario() {
        let cipher = AesGcmCipher;
        let key = cipher.generate_key();
        let plaintext = random_bytes(1024);

        let envelope = cipher
            .encrypt(&plaintext, &key[..], &EncryptContext::default())
            .unwrap();

        assert_eq!(envelope.ciphertext.len(), 1024);
        assert_eq!(envelope.auth_tag.len(), 16);
        assert_eq!(envelope.nonce.len(), 12);
        assert_eq!(envelope.algorithm, Algorithm::Aes256Gcm);

        let decrypted = cipher
            .decrypt(&envelope, &key[..], &DecryptContext::default())
            .unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        for cipher in ciphers() {
            let key = [42u8; KEY_LENGTH];
            let plaintext = b"Hello, World!";

            let envelope = cipher
                .encrypt(plaintext, &key, &EncryptContext::default())
                .unwrap();
            let decrypted = cipher
                .decrypt(&envelope, &key, &DecryptContext::default())
                .unwrap();

            assert_eq!(decrypted, plaintext);
            assert_eq!(envelope.nonce.len(), cipher.nonce_size());
        }
    }

    #[test]
    fn test_xchacha_nonce_is_24_bytes() {
        let envelope = XChaChaCipher
            .encrypt(b"data", &[1u8; KEY_LENGTH], &EncryptContext::default())
            .unwrap();
        assert_eq!(envelope.nonce.len(), 24);
        assert_eq!(envelope.algorithm, Algorithm::XChaCha20Poly1305);
    }

    #[test]
    fn test_different_nonce_each_time() {
        for cipher in ciphers() {
            let key = [42u8; KEY_LENGTH];
            let plaintext = b"Same plaintext";

            let e1 = cipher.encrypt(plaintext, &key, &EncryptContext::default()).unwrap();
            let e2 = cipher.encrypt(plaintext, &key, &EncryptContext::default()).unwrap();

            assert_ne!(e1.nonce, e2.nonce);
            assert_ne!(e1.ciphertext, e2.ciphertext);
        }
    }

    #[test]
    fn test_every_bit_flip_detected() {
        for cipher in ciphers() {
            let key = [7u8; KEY_LENGTH];
            let envelope = cipher
                .encrypt(b"short secret", &key, &EncryptContext::default())
                .unwrap();

            for byte in 0..envelope.ciphertext.len() {
                for bit in 0..8 {
                    let mut tampered = envelope.clone();
                    tampered.ciphertext[byte] ^= 1 << bit;
                    assert!(matches!(
                        cipher.decrypt(&tampered, &key, &DecryptContext::default()),
                        Err(Error::DecryptionFailed(_))
                    ));
                }
            }

            for byte in 0..TAG_SIZE {
                for bit in 0..8 {
                    let mut tampered = envelope.clone();
                    tampered.auth_tag[byte] ^= 1 << bit;
                    assert!(matches!(
                        cipher.decrypt(&tampered, &key, &DecryptContext::default()),
                        Err(Error::DecryptionFailed(_))
                    ));
                }
            }

            let mut tampered = envelope.clone();
            tampered.nonce[0] ^= 0x01;
            assert!(matches!(
                cipher.decrypt(&tampered, &key, &DecryptContext::default()),
                Err(Error::DecryptionFailed(_))
            ));
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        for cipher in ciphers() {
            let envelope = cipher
                .encrypt(b"Secret data", &[1u8; KEY_LENGTH], &EncryptContext::default())
                .unwrap();
            let result = cipher.decrypt(&envelope, &[2u8; KEY_LENGTH], &DecryptContext::default());
            assert!(matches!(result, Err(Error::DecryptionFailed(_))));
        }
    }

    #[test]
    fn test_algorithm_binding() {
        let key = [3u8; KEY_LENGTH];
        let aes_envelope = AesGcmCipher
            .encrypt(b"payload", &key, &EncryptContext::default())
            .unwrap();
        let chacha_envelope = XChaChaCipher
            .encrypt(b"payload", &key, &EncryptContext::default())
            .unwrap();

        assert!(matches!(
            XChaChaCipher.decrypt(&aes_envelope, &key, &DecryptContext::default()),
            Err(Error::AlgorithmNotSupported(_))
        ));
        assert!(matches!(
            AesGcmCipher.decrypt(&chacha_envelope, &key, &DecryptContext::default()),
            Err(Error::AlgorithmNotSupported(_))
        ));

        // Relabelling the envelope does not get past the nonce check either.
        let mut relabelled = aes_envelope.clone();
        relabelled.algorithm = Algorithm::XChaCha20Poly1305;
        assert!(XChaChaCipher
            .decrypt(&relabelled, &key, &DecryptContext::default())
            .is_err());
    }

    #[test]
    fn test_additional_data_must_match() {
        for cipher in ciphers() {
            let key = [9u8; KEY_LENGTH];
            let envelope = cipher
                .encrypt(b"bound", &key, &EncryptContext::with_additional_data(b"item-1".to_vec()))
                .unwrap();

            let ok = cipher
                .decrypt(
                    &envelope,
                    &key,
                    &DecryptContext::default().with_additional_data(b"item-1".to_vec()),
                )
                .unwrap();
            assert_eq!(ok, b"bound");

            let wrong = cipher.decrypt(
                &envelope,
                &key,
                &DecryptContext::default().with_additional_data(b"item-2".to_vec()),
            );
            assert!(matches!(wrong, Err(Error::DecryptionFailed(_))));

            let missing = cipher.decrypt(&envelope, &key, &DecryptContext::default());
            assert!(matches!(missing, Err(Error::DecryptionFailed(_))));
        }
    }

    #[test]
    fn test_expired_before_crypto() {
        let key = [4u8; KEY_LENGTH];
        let mut envelope = AesGcmCipher
            .encrypt(b"old", &key, &EncryptContext::default())
            .unwrap();
        envelope.timestamp -= 60_000;

        // Wrong key would fail authentication; expiry must be reported first.
        let result = AesGcmCipher.decrypt(
            &envelope,
            &[5u8; KEY_LENGTH],
            &DecryptContext::default().with_max_age(Duration::from_secs(30)),
        );
        assert!(matches!(result, Err(Error::DataExpired { .. })));

        let fresh = AesGcmCipher.decrypt(
            &envelope,
            &key,
            &DecryptContext::default().with_max_age(Duration::from_secs(3600)),
        );
        assert_eq!(fresh.unwrap(), b"old");
    }

    #[test]
    fn test_preconditions() {
        for cipher in ciphers() {
            assert!(matches!(
                cipher.encrypt(b"data", &[0u8; 16], &EncryptContext::default()),
                Err(Error::InvalidKeyLength { expected: 32, actual: 16 })
            ));
            assert!(matches!(
                cipher.encrypt(b"", &[0u8; KEY_LENGTH], &EncryptContext::default()),
                Err(Error::InvalidDataSize(_))
            ));

            let envelope = cipher
                .encrypt(b"data", &[0u8; KEY_LENGTH], &EncryptContext::default())
                .unwrap();
            assert!(matches!(
                cipher.decrypt(&envelope, &[0u8; 31], &DecryptContext::default()),
                Err(Error::InvalidKeyLength { .. })
            ));

            let mut short_tag = envelope.clone();
            short_tag.auth_tag.pop();
            assert!(matches!(
                cipher.decrypt(&short_tag, &[0u8; KEY_LENGTH], &DecryptContext::default()),
                Err(Error::InvalidDataSize(_))
            ));
        }
    }

    #[test]
    fn test_validate_helpers() {
        assert!(AesGcmCipher.validate_nonce(&[0u8; 12]).is_ok());
        assert!(AesGcmCipher.validate_nonce(&[0u8; 24]).is_err());
        assert!(XChaChaCipher.validate_nonce(&[0u8; 24]).is_ok());
        assert!(XChaChaCipher.validate_nonce(&[0u8; 12]).is_err());
        assert!(AesGcmCipher.validate_key(&[0u8; 32]).is_ok());
        assert!(AesGcmCipher.validate_key(&[0u8; 33]).is_err());

        let k1 = XChaChaCipher.generate_key();
        let k2 = XChaChaCipher.generate_key();
        assert_ne!(*k1, *k2);
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(Algorithm::Aes256Gcm.to_string(), "AES-256-GCM");
        assert_eq!("xchacha".parse::<Algorithm>().unwrap(), Algorithm::XChaCha20Poly1305);
        assert_eq!("AES-256-GCM".parse::<Algorithm>().unwrap(), Algorithm::Aes256Gcm);
        assert!("des".parse::<Algorithm>().is_err());
    }
}
