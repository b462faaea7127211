//! Security event reporting.
//!
//! Events carry identifiers, algorithms and failure classes only. Keys,
//! passwords and plaintext never reach a sink.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use tracing::info;

use lockbox_common::Error;
use lockbox_crypto::{Algorithm, KdfAlgorithm};

/// Why the vault locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockReason {
    Explicit,
    Timeout,
}

/// Coarse failure class recorded in audit events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Authentication, algorithm binding or expiry failure.
    Decryption,
    KeyDerivation,
    InvalidInput,
    Locked,
    Cancelled,
    Other,
}

impl From<&Error> for FailureKind {
    fn from(err: &Error) -> Self {
        match err {
            e if e.is_decryption_failure() => FailureKind::Decryption,
            Error::KeyDerivationFailed(_) => FailureKind::KeyDerivation,
            Error::InvalidKeyLength { .. }
            | Error::InvalidDataSize(_)
            | Error::InvalidParameter(_) => FailureKind::InvalidInput,
            Error::VaultLocked => FailureKind::Locked,
            Error::Cancelled(_) => FailureKind::Cancelled,
            _ => FailureKind::Other,
        }
    }
}

/// A security-relevant event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum AuditEvent {
    UnlockSucceeded {
        kdf: KdfAlgorithm,
        derivation_ms: u64,
    },
    UnlockFailed {
        failure: FailureKind,
    },
    Locked {
        reason: LockReason,
    },
    ItemEncrypted {
        item_id: String,
        algorithm: Algorithm,
    },
    DecryptAttempted {
        item_id: String,
        algorithm: Algorithm,
        envelope_age_ms: i64,
    },
    DecryptFailed {
        item_id: String,
        algorithm: Algorithm,
        failure: FailureKind,
    },
    KdfRotated {
        kdf: KdfAlgorithm,
    },
}

/// Receiver for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Emits events as structured `tracing` records under `lockbox::audit`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        info!(target: "lockbox::audit", ?event, "Audit event");
    }
}

/// Keeps events in memory. Useful for tests and embedding hosts that
/// forward events elsewhere.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
