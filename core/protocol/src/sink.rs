//! Where accepted uploads end up.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use lanvault_common::{Error, Result};
use lanvault_vault::Vault;

/// Result of persisting one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    pub id: i64,
    pub name: String,
    pub size: u64,
}

/// Storage backend for received files.
#[async_trait]
pub trait FileSink: Send + Sync {
    /// Persist `data` as `name` inside the folder called `folder`.
    async fn store(
        &self,
        folder: &str,
        name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> Result<StoredFile>;
}

/// Stores uploads in an unlocked [`Vault`].
///
/// The vault is synchronous; each write runs to completion on the blocking
/// pool even if the request that started it goes away.
pub struct VaultFileSink {
    vault: Arc<Vault>,
}

impl VaultFileSink {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self { vault }
    }
}

#[async_trait]
impl FileSink for VaultFileSink {
    async fn store(
        &self,
        folder: &str,
        name: &str,
        mime_type: &str,
        data: Vec<u8>,
    ) -> Result<StoredFile> {
        let vault = Arc::clone(&self.vault);
        let folder = folder.to_string();
        let name = name.to_string();
        let mime_type = mime_type.to_string();

        let record = tokio::task::spawn_blocking(move || {
            let folder_id = vault.ensure_folder(&folder)?;
            vault.store(folder_id, &name, &mime_type, &data)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        debug!(id = record.id, "Upload persisted in vault");
        Ok(StoredFile {
            id: record.id,
            name: record.name,
            size: record.size,
        })
    }
}
