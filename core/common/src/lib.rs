//! Common utilities and types shared across Lockbox modules.
//!
//! This module provides the error taxonomy used by every engine operation
//! and the small value types (item identifiers, passwords, sensitive
//! buffers) that cross crate boundaries.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ItemId, Password, SensitiveBytes};
