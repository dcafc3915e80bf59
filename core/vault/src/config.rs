//! On-disk layout of a LanVault data directory.

use std::path::{Path, PathBuf};

use lanvault_common::{Error, Result};

/// Container file name in the data directory.
pub const VAULT_FILENAME: &str = "vault.tvault";

/// SQLite metadata database file name.
pub const INDEX_FILENAME: &str = "index.db";

/// Directory holding the TLS identity.
pub const TLS_DIRNAME: &str = "tls";

/// Receiver configuration file name.
pub const CONFIG_FILENAME: &str = "config.json";

/// Directory name used under the home directory by default.
pub const DEFAULT_DIRNAME: &str = ".lanvault";

/// Resolved paths for everything stored in a data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultPaths {
    root: PathBuf,
}

impl VaultPaths {
    /// Use `root` as the data directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Default data directory (`~/.lanvault`).
    ///
    /// # Errors
    /// - Returns error if the home directory cannot be determined
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::NotFound("Home directory not found".to_string()))?;
        Ok(Self::new(home.join(DEFAULT_DIRNAME)))
    }

    /// Create the data directory if needed.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.tls_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vault_file(&self) -> PathBuf {
        self.root.join(VAULT_FILENAME)
    }

    pub fn index_file(&self) -> PathBuf {
        self.root.join(INDEX_FILENAME)
    }

    pub fn tls_dir(&self) -> PathBuf {
        self.root.join(TLS_DIRNAME)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILENAME)
    }
}
