//! Vault key engine for Lockbox.
//!
//! This module provides:
//! - The persisted, non-secret account record and its verification canary
//! - The master/item key hierarchy with lock, unlock and auto-lock
//! - Item encryption and decryption bound to item ids
//! - Master key rotation when KDF settings are upgraded
//! - Metadata-only audit events
//!
//! # Architecture
//! The engine sits between CRUD/UI collaborators and storage. Callers pass
//! item ids and plaintext in and receive envelopes back; storage only ever
//! sees envelopes and the account record.

pub mod audit;
pub mod config;
pub mod hierarchy;

pub use audit::{AuditEvent, AuditSink, FailureKind, LockReason, MemoryAuditSink, TracingAuditSink};
pub use config::{AccountConfig, AccountOptions, FormatVersion};
pub use hierarchy::{HierarchyBuilder, KeyRotation, LockState, UnlockReport, VaultKeyHierarchy};
