//! Cryptographic primitives for LanVault.
//!
//! This module provides:
//! - Password key derivation using Argon2id
//! - Authenticated encryption using XChaCha20-Poly1305
//! - Data key wrapping and per-file key derivation
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Decryption failures are reported uniformly as `AuthenticationFailure`

pub mod aead;
pub mod kdf;
pub mod keys;

pub use aead::{decrypt, encrypt, NONCE_SIZE, TAG_SIZE};
pub use kdf::{derive_key, KdfParams};
pub use keys::{DataKey, FileKey, PasswordKey, Salt, KEY_LENGTH, SALT_LENGTH, WRAPPED_KEY_LENGTH};
