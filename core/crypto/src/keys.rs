//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.
//!
//! The hierarchy is shallow: a password-derived [`PasswordKey`] wraps the
//! random [`DataKey`], and the data key yields one [`FileKey`] per stored
//! file from that file's UUID.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::aead::{decrypt, encrypt, NONCE_SIZE, TAG_SIZE};
use lanvault_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of password salts in bytes.
pub const SALT_LENGTH: usize = 32;

/// Length of a data key after wrapping (nonce || key || tag).
pub const WRAPPED_KEY_LENGTH: usize = NONCE_SIZE + KEY_LENGTH + TAG_SIZE;

/// Random key that encrypts vault contents.
///
/// Generated once when the vault is created and only ever persisted in
/// wrapped form. Held in memory while the vault is unlocked.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    key: [u8; KEY_LENGTH],
}

impl DataKey {
    /// Generate a random data key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Create a data key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Derive the key for one stored file.
    ///
    /// `file_key = BLAKE2b-256(data_key || file_uuid)`. Deterministic, so the
    /// key is recomputed from the record's UUID on every read and never
    /// stored.
    pub fn derive_file_key(&self, file_uuid: &str) -> FileKey {
        use blake2::digest::consts::U32;
        use blake2::{Blake2b, Digest};

        let mut hasher = Blake2b::<U32>::new();
        hasher.update(self.key);
        hasher.update(file_uuid.as_bytes());

        let result = hasher.finalize();
        let mut derived = [0u8; KEY_LENGTH];
        derived.copy_from_slice(&result);
        FileKey::from_bytes(derived)
    }

    /// Encrypt this data key under a password key.
    ///
    /// # Postconditions
    /// - Output is exactly WRAPPED_KEY_LENGTH bytes
    pub fn wrap(&self, wrapping_key: &PasswordKey) -> Result<Vec<u8>> {
        encrypt(wrapping_key.as_bytes(), &self.key)
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataKey([REDACTED])")
    }
}

/// Key derived from the user's password; used only for wrapping.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PasswordKey {
    key: [u8; KEY_LENGTH],
}

impl PasswordKey {
    /// Create a password key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Recover the data key from its wrapped form.
    ///
    /// # Errors
    /// - `AuthenticationFailure` if this key did not wrap it (wrong password)
    ///   or the wrapped bytes were modified
    /// - `StorageCorruption` if the authenticated payload has the wrong size
    pub fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<DataKey> {
        let mut plain = decrypt(&self.key, wrapped)?;
        if plain.len() != KEY_LENGTH {
            plain.zeroize();
            return Err(Error::StorageCorruption(
                "Unwrapped data key has unexpected length".to_string(),
            ));
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&plain);
        plain.zeroize();
        Ok(DataKey::from_bytes(key))
    }
}

impl fmt::Debug for PasswordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PasswordKey([REDACTED])")
    }
}

/// Key for encrypting one file's contents.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FileKey {
    key: [u8; KEY_LENGTH],
}

impl FileKey {
    /// Create a file key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileKey([REDACTED])")
    }
}

/// Salt for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt(pub [u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LENGTH];
        rand::thread_rng().fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Create from a slice read off disk.
    ///
    /// # Errors
    /// - `StorageCorruption` if the slice is not SALT_LENGTH bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let salt: [u8; SALT_LENGTH] = bytes
            .try_into()
            .map_err(|_| Error::StorageCorruption(format!("Salt must be {} bytes", SALT_LENGTH)))?;
        Ok(Self(salt))
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}
