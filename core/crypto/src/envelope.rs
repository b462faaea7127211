//! The encrypted unit exchanged with storage.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::aead::{Algorithm, TAG_SIZE};
use crate::encoding::base64_bytes;
use lockbox_common::{Error, Result};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Ciphertext plus everything needed to decrypt it, except the key.
///
/// Persisted as JSON:
/// `{"algorithm", "nonce", "ciphertext", "authTag", "timestamp"}` with byte
/// fields in base64. Holds no plaintext and no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionEnvelope {
    /// Construction that produced this envelope.
    pub algorithm: Algorithm,
    /// 12 bytes (AES-256-GCM) or 24 bytes (XChaCha20-Poly1305).
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    /// Same length as the plaintext.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    /// 16-byte authentication tag.
    #[serde(with = "base64_bytes")]
    pub auth_tag: Vec<u8>,
    /// Creation time in ms since epoch. Only used for age checks.
    pub timestamp: i64,
}

impl EncryptionEnvelope {
    /// Age relative to `now_ms`. Envelopes from the future have age 0.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.timestamp).max(0)
    }

    /// Check field sizes against the recorded algorithm.
    ///
    /// # Errors
    /// - `InvalidDataSize` if nonce, tag or ciphertext has an impossible size
    pub fn validate(&self) -> Result<()> {
        if self.nonce.len() != self.algorithm.nonce_size() {
            return Err(Error::InvalidDataSize(format!(
                "{} nonce must be {} bytes, got {}",
                self.algorithm,
                self.algorithm.nonce_size(),
                self.nonce.len()
            )));
        }
        if self.auth_tag.len() != TAG_SIZE {
            return Err(Error::InvalidDataSize(format!(
                "Authentication tag must be {} bytes, got {}",
                TAG_SIZE,
                self.auth_tag.len()
            )));
        }
        if self.ciphertext.is_empty() {
            return Err(Error::InvalidDataSize("Ciphertext is empty".to_string()));
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON and validate field sizes.
    pub fn from_json(json: &str) -> Result<Self> {
        let envelope: Self =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Serialize to bytes for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from bytes and validate field sizes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Self =
            serde_json::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EncryptionEnvelope {
        EncryptionEnvelope {
            algorithm: Algorithm::Aes256Gcm,
            nonce: vec![1u8; 12],
            ciphertext: vec![2u8; 5],
            auth_tag: vec![3u8; 16],
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_json_shape() {
        let json = sample().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["algorithm"], "AES-256-GCM");
        assert_eq!(value["nonce"], "AQEBAQEBAQEBAQEB");
        assert_eq!(value["authTag"].as_str().unwrap().len(), 24);
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
        assert!(value.get("auth_tag").is_none());
    }

    #[test]
    fn test_bytes_restore() {
        let envelope = sample();
        let restored = EncryptionEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, envelope);
    }

    #[test]
    fn test_from_json_rejects_bad_sizes() {
        let mut wrong_nonce = sample();
        wrong_nonce.algorithm = Algorithm::XChaCha20Poly1305;
        let json = serde_json::to_string(&wrong_nonce).unwrap();
        assert!(matches!(
            EncryptionEnvelope::from_json(&json),
            Err(Error::InvalidDataSize(_))
        ));

        let mut short_tag = sample();
        short_tag.auth_tag.truncate(8);
        let json = serde_json::to_string(&short_tag).unwrap();
        assert!(EncryptionEnvelope::from_json(&json).is_err());

        assert!(matches!(
            EncryptionEnvelope::from_json("{\"algorithm\":\"DES\"}"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_age() {
        let envelope = sample();
        assert_eq!(envelope.age_ms(envelope.timestamp + 250), 250);
        assert_eq!(envelope.age_ms(envelope.timestamp - 1000), 0);
    }
}
