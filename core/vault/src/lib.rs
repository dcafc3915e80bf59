//! Vault engine for LanVault.
//!
//! This module provides:
//! - The fixed-size key header holding the password-wrapped data key
//! - A free-space allocator placing encrypted blobs inside one growable file
//! - SQLite metadata for files, folders and reclaimed ranges
//! - The vault service tying these together behind lock/unlock
//!
//! # Architecture
//! The container file starts with a `HEADER_SIZE` header; everything after
//! it is ciphertext at offsets recorded only in the metadata index. There is
//! no directory inside the container.

pub mod blob;
pub mod config;
pub mod header;
pub mod index;
pub mod vault;

pub use blob::BlobStore;
pub use config::VaultPaths;
pub use header::{KeyVaultHeader, HEADER_SIZE, HEADER_VERSION};
pub use index::{FileRecord, FolderInfo, FreeSpace, NewFile, VaultIndex};
pub use vault::{ExportFailure, ExportReport, ExportedFile, Vault, MIN_PASSWORD_LENGTH};
