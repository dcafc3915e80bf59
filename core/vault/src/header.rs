//! Fixed-size key header at offset 0 of the container file.
//!
//! Layout (little-endian lengths):
//!
//! ```text
//! [0]        version (u8)
//! [1..5]     salt length (u32)
//! [5..]      salt
//! [..+4]     wrapped key length (u32)
//! [..]       wrapped data key (nonce || key || tag)
//! [..256]    zero padding
//! ```

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use lanvault_common::{Error, Result};
use lanvault_crypto::{derive_key, DataKey, KdfParams, Salt};

/// Size of the header region; the blob body starts here.
pub const HEADER_SIZE: usize = 256;

/// Current header format version.
pub const HEADER_VERSION: u8 = 1;

/// Size of each length prefix.
const LENGTH_FIELD_SIZE: usize = 4;

/// Parsed header contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderContents {
    pub version: u8,
    pub salt: Vec<u8>,
    pub wrapped_key: Vec<u8>,
}

impl HeaderContents {
    /// Serialize into exactly HEADER_SIZE bytes.
    ///
    /// # Errors
    /// - `InvalidInput` if the fields do not fit
    pub fn encode(&self) -> Result<Vec<u8>> {
        let needed = 1 + LENGTH_FIELD_SIZE + self.salt.len() + LENGTH_FIELD_SIZE + self.wrapped_key.len();
        if needed > HEADER_SIZE {
            return Err(Error::InvalidInput(format!(
                "Header too large: {} > {}",
                needed, HEADER_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.push(self.version);
        write_length_prefixed(&mut buf, &self.salt);
        write_length_prefixed(&mut buf, &self.wrapped_key);
        buf.resize(HEADER_SIZE, 0);
        Ok(buf)
    }

    /// Parse a full header region.
    ///
    /// # Errors
    /// - `StorageCorruption` on short input, unknown version, or length
    ///   prefixes pointing outside the header
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(corrupt("short header"));
        }
        let bytes = &bytes[..HEADER_SIZE];

        let version = bytes[0];
        if version != HEADER_VERSION {
            return Err(corrupt(&format!("unsupported version {}", version)));
        }

        let mut cursor = 1;
        let salt = read_length_prefixed(bytes, &mut cursor)?;
        let wrapped_key = read_length_prefixed(bytes, &mut cursor)?;

        Ok(Self {
            version,
            salt,
            wrapped_key,
        })
    }
}

fn corrupt(detail: &str) -> Error {
    Error::StorageCorruption(format!("Corrupted vault header: {}", detail))
}

fn write_length_prefixed(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
}

fn read_length_prefixed(bytes: &[u8], cursor: &mut usize) -> Result<Vec<u8>> {
    let len_end = *cursor + LENGTH_FIELD_SIZE;
    let len_bytes: [u8; LENGTH_FIELD_SIZE] = bytes
        .get(*cursor..len_end)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| corrupt("truncated length field"))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let data = bytes
        .get(len_end..len_end.saturating_add(len))
        .ok_or_else(|| corrupt("field exceeds header"))?;
    *cursor = len_end + len;
    Ok(data.to_vec())
}

/// Persists and recovers the password-wrapped data key.
pub struct KeyVaultHeader {
    path: PathBuf,
    params: KdfParams,
}

impl KeyVaultHeader {
    /// Header stored at the start of the container at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_params(path, KdfParams::moderate())
    }

    /// Use explicit KDF parameters.
    pub fn with_params(path: impl AsRef<Path>, params: KdfParams) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            params,
        }
    }

    /// Path of the container file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a container (and therefore a header) exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the container with a fresh data key wrapped under `password`.
    ///
    /// # Postconditions
    /// - Container file exists and is exactly HEADER_SIZE bytes long
    /// - Returns the generated data key
    ///
    /// # Errors
    /// - `AlreadyExists` if a header is already present
    /// - `InvalidInput` if the password is empty
    ///
    /// The header is written to a temporary file in the same directory,
    /// synced, and then linked into place without overwriting, so a crash
    /// never leaves a partial header at `path`.
    pub fn initialize(&self, password: &[u8]) -> Result<DataKey> {
        if self.exists() {
            return Err(Error::AlreadyExists("Vault already initialized".to_string()));
        }

        let data_key = DataKey::generate();
        let salt = Salt::generate();
        let password_key = derive_key(password, &salt, &self.params)?;
        let wrapped_key = data_key.wrap(&password_key)?;

        let contents = HeaderContents {
            version: HEADER_VERSION,
            salt: salt.as_bytes().to_vec(),
            wrapped_key,
        };
        let bytes = contents.encode()?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist_noclobber(&self.path).map_err(|e| {
            if e.error.kind() == ErrorKind::AlreadyExists {
                Error::AlreadyExists("Vault already initialized".to_string())
            } else {
                Error::Io(e.error)
            }
        })?;

        info!(path = %self.path.display(), "Vault header initialized");
        Ok(data_key)
    }

    /// Read and parse the header.
    ///
    /// # Errors
    /// - `NotFound` if the container does not exist
    /// - `StorageCorruption` if it is shorter than HEADER_SIZE or malformed
    pub fn read(&self) -> Result<HeaderContents> {
        let mut file = File::open(&self.path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::NotFound("Vault header not found".to_string())
            } else {
                Error::Io(e)
            }
        })?;

        let mut buf = vec![0u8; HEADER_SIZE];
        file.read_exact(&mut buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                corrupt("short header")
            } else {
                Error::Io(e)
            }
        })?;

        HeaderContents::decode(&buf)
    }

    /// Recover the data key with `password`.
    ///
    /// # Errors
    /// - `NotFound` if no header exists
    /// - `StorageCorruption` if the header cannot be parsed
    /// - `AuthenticationFailure` if the password is wrong
    pub fn unlock(&self, password: &[u8]) -> Result<DataKey> {
        debug!(path = %self.path.display(), "Unlocking vault header");
        let contents = self.read()?;
        let salt = Salt::from_slice(&contents.salt)?;
        let password_key = derive_key(password, &salt, &self.params)?;

        password_key.unwrap_data_key(&contents.wrapped_key).map_err(|e| {
            if matches!(e, Error::AuthenticationFailure) {
                warn!("Vault unlock rejected");
            }
            e
        })
    }
}
