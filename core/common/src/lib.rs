//! Common utilities and types shared across the LanVault crates.
//!
//! This module provides the error taxonomy and the identifier newtypes
//! used by the vault, the pairing/transfer protocol and the network layer.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{FileId, SessionId, TransmissionId};
