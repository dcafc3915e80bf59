//! The vault service: encrypted file storage in a single container.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock};

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::VaultPaths;
use crate::header::KeyVaultHeader;
use crate::index::{FileRecord, FolderInfo, NewFile, VaultIndex};
use lanvault_common::{Error, Result};
use lanvault_crypto::{decrypt, encrypt, DataKey, KdfParams};

/// Minimum accepted password length, in characters.
pub const MIN_PASSWORD_LENGTH: usize = 6;

/// One successfully exported file.
#[derive(Debug, Clone, Serialize)]
pub struct ExportedFile {
    pub id: i64,
    pub path: PathBuf,
}

/// One file that could not be exported.
#[derive(Debug, Clone, Serialize)]
pub struct ExportFailure {
    pub id: i64,
    pub error: String,
}

/// Outcome of a batch export. Failures do not stop the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportReport {
    pub exported: Vec<ExportedFile>,
    pub failures: Vec<ExportFailure>,
}

impl ExportReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Encrypted file store backed by one container file and a metadata index.
///
/// Store and delete run allocation, blob write and metadata commit under
/// the index lock, so two writers never receive overlapping ranges.
/// Fetch only takes the lock for the metadata lookup; committed ranges are
/// immutable until deleted.
pub struct Vault {
    paths: VaultPaths,
    header: KeyVaultHeader,
    blobs: BlobStore,
    index: Mutex<VaultIndex>,
    data_key: RwLock<Option<DataKey>>,
}

impl Vault {
    /// Open the vault in `paths`, creating the directory and index if needed.
    ///
    /// The vault starts locked.
    pub fn open(paths: VaultPaths) -> Result<Self> {
        Self::open_with_params(paths, KdfParams::moderate())
    }

    /// Open with explicit KDF parameters.
    pub fn open_with_params(paths: VaultPaths, params: KdfParams) -> Result<Self> {
        paths.ensure_dirs()?;
        let vault_file = paths.vault_file();
        let index = VaultIndex::open(paths.index_file())?;

        Ok(Self {
            header: KeyVaultHeader::with_params(&vault_file, params),
            blobs: BlobStore::new(&vault_file),
            index: Mutex::new(index),
            data_key: RwLock::new(None),
            paths,
        })
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    pub fn is_initialized(&self) -> bool {
        self.header.exists()
    }

    /// Create the container and leave the vault unlocked.
    ///
    /// # Errors
    /// - `InvalidInput` if the password is shorter than MIN_PASSWORD_LENGTH
    /// - `AlreadyExists` if the vault is already initialized
    pub fn initialize(&self, password: &str) -> Result<()> {
        if password.chars().count() < MIN_PASSWORD_LENGTH {
            return Err(Error::InvalidInput(format!(
                "Password must be at least {} characters",
                MIN_PASSWORD_LENGTH
            )));
        }

        let key = self.header.initialize(password.as_bytes())?;
        *self.key_slot_mut()? = Some(key);
        info!(path = %self.paths.root().display(), "Vault initialized");
        Ok(())
    }

    /// Recover the data key and keep it in memory.
    ///
    /// # Errors
    /// - `NotFound` if the vault was never initialized
    /// - `AuthenticationFailure` on a wrong password
    /// - `StorageCorruption` if the header is damaged
    pub fn unlock(&self, password: &str) -> Result<()> {
        let key = self.header.unlock(password.as_bytes())?;
        *self.key_slot_mut()? = Some(key);
        info!("Vault unlocked");
        Ok(())
    }

    /// Drop the data key. It is zeroized on drop.
    pub fn lock(&self) -> Result<()> {
        *self.key_slot_mut()? = None;
        info!("Vault locked");
        Ok(())
    }

    pub fn is_unlocked(&self) -> bool {
        self.data_key
            .read()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// Encrypt `data` and persist it as a new file record.
    ///
    /// # Postconditions
    /// - The returned record's range does not overlap any other live record
    ///
    /// # Errors
    /// - `Locked` if the vault is locked
    /// - `InvalidInput` if `name` is empty
    /// - `NotFound` if the folder does not exist
    ///
    /// A failure before the metadata commit rolls the allocation back. If
    /// the range was appended, the written bytes remain as unreferenced
    /// slack past the last record; they are never handed out again unless
    /// a later append overwrites them.
    pub fn store(
        &self,
        folder_id: i64,
        name: &str,
        mime_type: &str,
        data: &[u8],
    ) -> Result<FileRecord> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("File name cannot be empty".to_string()));
        }

        let uuid = Uuid::new_v4().to_string();
        let ciphertext = {
            let slot = self.key_slot()?;
            let key = slot.as_ref().ok_or(Error::Locked)?;
            let file_key = key.derive_file_key(&uuid);
            encrypt(file_key.as_bytes(), data)?
        };
        let length = ciphertext.len() as u64;

        let mut index = self.lock_index()?;
        if !index.folder_exists(folder_id)? {
            return Err(Error::NotFound(format!("Folder {} not found", folder_id)));
        }

        let tx = index.begin()?;
        let offset = self.blobs.allocate(&tx, length)?;
        self.blobs.write_at(offset, &ciphertext)?;
        let id = tx.insert_file_metadata(&NewFile {
            uuid: &uuid,
            name,
            size: data.len() as u64,
            mime_type,
            folder_id,
            offset,
            length,
        })?;
        tx.commit()?;

        let record = index
            .file_by_id(id)?
            .ok_or_else(|| Error::StorageCorruption(format!("File {} vanished after commit", id)))?;
        info!(id, offset, length, "Stored file");
        Ok(record)
    }

    /// Decrypt a stored file.
    ///
    /// # Errors
    /// - `Locked` if the vault is locked
    /// - `NotFound` if the id is unknown or deleted
    /// - `AuthenticationFailure` if the ciphertext does not authenticate
    /// - `StorageCorruption` if the range lies outside the container
    ///
    /// The blob is read after the index lock is released, so a concurrent
    /// `delete` followed by a `store` may overwrite the range mid-read. A
    /// failed decryption is therefore checked against the index again and
    /// reported as `NotFound` when the record is gone.
    pub fn fetch(&self, id: i64) -> Result<Vec<u8>> {
        self.ensure_unlocked()?;
        let record = self.record(id)?;
        self.read_live(&record)
    }

    fn read_live(&self, record: &FileRecord) -> Result<Vec<u8>> {
        match self.read_record(record) {
            Err(Error::AuthenticationFailure) => {
                let current = self.lock_index()?.file_by_id(record.id)?;
                match current {
                    Some(live) if live.offset == record.offset && live.uuid == record.uuid => {
                        Err(Error::AuthenticationFailure)
                    }
                    _ => Err(Error::NotFound(format!("File {} not found", record.id))),
                }
            }
            other => other,
        }
    }

    /// Mark a file deleted and release its range.
    ///
    /// # Errors
    /// - `Locked` if the vault is locked
    /// - `NotFound` if the id is unknown or already deleted
    pub fn delete(&self, id: i64) -> Result<()> {
        self.ensure_unlocked()?;

        let mut index = self.lock_index()?;
        let tx = index.begin()?;
        let record = tx
            .file_by_id(id)?
            .ok_or_else(|| Error::NotFound(format!("File {} not found", id)))?;
        tx.mark_deleted(id)?;
        self.blobs.free(&tx, record.offset, record.length)?;
        tx.commit()?;

        info!(id, offset = record.offset, length = record.length, "Deleted file");
        Ok(())
    }

    /// Live record by id.
    pub fn record(&self, id: i64) -> Result<FileRecord> {
        self.lock_index()?
            .file_by_id(id)?
            .ok_or_else(|| Error::NotFound(format!("File {} not found", id)))
    }

    pub fn ensure_folder(&self, name: &str) -> Result<i64> {
        self.lock_index()?.ensure_folder(name)
    }

    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        self.lock_index()?.list_files()
    }

    pub fn list_folders(&self) -> Result<Vec<FolderInfo>> {
        self.lock_index()?.list_folders()
    }

    pub fn files_in_folder(&self, folder_id: i64) -> Result<Vec<FileRecord>> {
        self.lock_index()?.files_in_folder(folder_id)
    }

    /// Decrypt each file into `dir` under a name that does not clash with
    /// existing files (`name-1.ext`, `name-2.ext`, ...).
    ///
    /// # Errors
    /// - `Locked` if the vault is locked
    /// - `Io` if `dir` cannot be created
    ///
    /// Per-file failures are collected in the report.
    pub fn export_files(&self, ids: &[i64], dir: &Path) -> Result<ExportReport> {
        self.ensure_unlocked()?;
        std::fs::create_dir_all(dir)?;

        let mut report = ExportReport::default();
        for &id in ids {
            match self.export_one(id, dir) {
                Ok(path) => report.exported.push(ExportedFile { id, path }),
                Err(e) => {
                    warn!(id, error = %e, "Export failed");
                    report.failures.push(ExportFailure {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            exported = report.exported.len(),
            failed = report.failures.len(),
            "Export finished"
        );
        Ok(report)
    }

    fn export_one(&self, id: i64, dir: &Path) -> Result<PathBuf> {
        let record = self.record(id)?;
        let data = self.read_record(&record)?;
        let path = unique_path(dir, &record.name, id);
        std::fs::write(&path, data)?;
        debug!(id, path = %path.display(), "Exported file");
        Ok(path)
    }

    fn read_record(&self, record: &FileRecord) -> Result<Vec<u8>> {
        let ciphertext = self.blobs.read_at(record.offset, record.length)?;

        let slot = self.key_slot()?;
        let key = slot.as_ref().ok_or(Error::Locked)?;
        let file_key = key.derive_file_key(&record.uuid);
        decrypt(file_key.as_bytes(), &ciphertext).map_err(|e| {
            error!(
                id = record.id,
                offset = record.offset,
                length = record.length,
                "Stored file failed to decrypt"
            );
            e
        })
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.key_slot()?.is_none() {
            return Err(Error::Locked);
        }
        Ok(())
    }

    fn lock_index(&self) -> Result<MutexGuard<'_, VaultIndex>> {
        self.index
            .lock()
            .map_err(|_| Error::StorageCorruption("Vault index lock poisoned".to_string()))
    }

    fn key_slot(&self) -> Result<std::sync::RwLockReadGuard<'_, Option<DataKey>>> {
        self.data_key
            .read()
            .map_err(|_| Error::StorageCorruption("Vault key lock poisoned".to_string()))
    }

    fn key_slot_mut(&self) -> Result<std::sync::RwLockWriteGuard<'_, Option<DataKey>>> {
        self.data_key
            .write()
            .map_err(|_| Error::StorageCorruption("Vault key lock poisoned".to_string()))
    }
}

/// Pick a path in `dir` for `name` that does not exist yet.
fn unique_path(dir: &Path, name: &str, id: i64) -> PathBuf {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("file-{}", id));

    let candidate = dir.join(&base);
    if !candidate.exists() {
        return candidate;
    }

    let as_path = Path::new(&base);
    let stem = as_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&base)
        .to_string();
    let ext = as_path.extension().and_then(|e| e.to_str());

    let mut n = 1u32;
    loop {
        let name = match ext {
            Some(ext) => format!("{}-{}.{}", stem, n, ext),
            None => format!("{}-{}", stem, n),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HEADER_SIZE;
    use proptest::prelude::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    fn open_vault(dir: &tempfile::TempDir) -> Vault {
        Vault::open_with_params(VaultPaths::new(dir.path()), fast_params()).unwrap()
    }

    fn unlocked_vault(dir: &tempfile::TempDir) -> (Vault, i64) {
        let vault = open_vault(dir);
        vault.initialize("secret1").unwrap();
        let folder = vault.ensure_folder("Received").unwrap();
        (vault, folder)
    }

    fn assert_no_overlap(vault: &Vault) {
        let mut files = vault.list_files().unwrap();
        files.sort_by_key(|f| f.offset);
        for f in &files {
            assert!(f.offset >= HEADER_SIZE as u64);
        }
        for pair in files.windows(2) {
            assert!(pair[0].end() <= pair[1].offset, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_initialize_and_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);
        assert!(!vault.is_initialized());

        vault.initialize("secret1").unwrap();
        assert!(vault.is_initialized());
        assert!(vault.is_unlocked());

        vault.lock().unwrap();
        assert!(!vault.is_unlocked());
        assert!(matches!(
            vault.unlock("wrong"),
            Err(Error::AuthenticationFailure)
        ));
        vault.unlock("secret1").unwrap();
        assert!(vault.is_unlocked());
    }

    #[test]
    fn test_short_password_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open_vault(&dir);
        assert!(matches!(
            vault.initialize("12345"),
            Err(Error::InvalidInput(_))
        ));
        assert!(!vault.is_initialized());
    }

    #[test]
    fn test_store_fetch_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (vault, folder) = unlocked_vault(&dir);

        let record = vault.store(folder, "a.txt", "text/plain", b"hello").unwrap();
        assert_eq!(record.size, 5);
        assert_eq!(record.offset, HEADER_SIZE as u64);
        assert_eq!(vault.fetch(record.id).unwrap(), b"hello");

        vault.delete(record.id).unwrap();
        assert!(matches!(vault.fetch(record.id), Err(Error::NotFound(_))));
        assert!(matches!(vault.delete(record.id), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_contents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let (vault, folder) = unlocked_vault(&dir);
            vault.store(folder, "a.txt", "text/plain", b"persisted").unwrap().id
        };

        let vault = open_vault(&dir);
        assert!(matches!(vault.fetch(id), Err(Error::Locked)));
        vault.unlock("secret1").unwrap();
        assert_eq!(vault.fetch(id).unwrap(), b"persisted");
    }

    #[test]
    fn test_operations_require_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let (vault, folder) = unlocked_vault(&dir);
        let id = vault.store(folder, "a.txt", "text/plain", b"x").unwrap().id;
        vault.lock().unwrap();

        assert!(matches!(
            vault.store(folder, "b.txt", "text/plain", b"y"),
            Err(Error::Locked)
        ));
        assert!(matches!(vault.fetch(id), Err(Error::Locked)));
        assert!(matches!(vault.delete(id), Err(Error::Locked)));
    }

    #[test]
    fn test_deleted_range_reused() {
        let dir = tempfile::tempdir().unwrap();
        let (vault, folder) = unlocked_vault(&dir);

        let big = vault.store(folder, "big.bin", "application/octet-stream", &[7u8; 400]).unwrap();
        vault.store(folder, "tail.bin", "application/octet-stream", &[8u8; 10]).unwrap();
        let size_before = std::fs::metadata(vault.paths().vault_file()).unwrap().len();

        vault.delete(big.id).unwrap();
        let small = vault.store(folder, "small.bin", "application/octet-stream", &[9u8; 100]).unwrap();

        assert_eq!(small.offset, big.offset);
        assert_eq!(
            std::fs::metadata(vault.paths().vault_file()).unwrap().len(),
            size_before
        );
        assert_eq!(vault.fetch(small.id).unwrap(), vec![9u8; 100]);
        assert_no_overlap(&vault);
    }

    #[test]
    fn test_unknown_folder() {
        let dir = tempfile::tempdir().unwrap();
        let (vault, folder) = unlocked_vault(&dir);
        assert!(matches!(
            vault.store(folder + 10, "a.txt", "text/plain", b"x"),
            Err(Error::NotFound(_))
        ));
        assert!(vault.list_files().unwrap().is_empty());
    }

    #[test]
    fn test_tampered_blob_fails_authentication() {
        let dir = tempfile::tempdir().unwrap();
        let (vault, folder) = unlocked_vault(&dir);
        let record = vault.store(folder, "a.txt", "text/plain", b"hello").unwrap();

        let mut bytes = std::fs::read(vault.paths().vault_file()).unwrap();
        bytes[record.offset as usize + 30] ^= 0xFF;
        std::fs::write(vault.paths().vault_file(), &bytes).unwrap();

        assert!(matches!(
            vault.fetch(record.id),
            Err(Error::AuthenticationFailure)
        ));
    }

    #[test]
    fn test_export_uses_unique_names_and_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (vault, folder) = unlocked_vault(&dir);

        let a = vault.store(folder, "note.txt", "text/plain", b"one").unwrap();
        let b = vault.store(folder, "note.txt", "text/plain", b"two").unwrap();

        let report = vault.export_files(&[a.id, 9999, b.id], out.path()).unwrap();

        assert_eq!(report.exported.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, 9999);
        assert!(!report.is_complete());
        assert_eq!(std::fs::read(out.path().join("note.txt")).unwrap(), b"one");
        assert_eq!(std::fs::read(out.path().join("note-1.txt")).unwrap(), b"two");
    }

    #[test]
    fn test_concurrent_stores_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let (vault, folder) = unlocked_vault(&dir);

        let survivors: Vec<(i64, Vec<u8>)> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4u8)
                .map(|worker| {
                    let vault = &vault;
                    scope.spawn(move || {
                        let mut kept = Vec::new();
                        for round in 0..20usize {
                            let data = vec![worker.wrapping_mul(31).wrapping_add(round as u8); 64 + round * 13];
                            let record = vault
                                .store(folder, "c.bin", "application/octet-stream", &data)
                                .unwrap();
                            if round % 3 == 0 {
                                vault.delete(record.id).unwrap();
                            } else {
                                kept.push((record.id, data));
                            }
                        }
                        kept
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        assert_no_overlap(&vault);
        assert_eq!(vault.list_files().unwrap().len(), survivors.len());
        for (id, data) in &survivors {
            assert_eq!(&vault.fetch(*id).unwrap(), data);
        }
    }

    #[test]
    fn test_read_of_replaced_range_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (vault, folder) = unlocked_vault(&dir);

        let stale = vault.store(folder, "a.bin", "", &[1u8; 100]).unwrap();
        vault.store(folder, "tail.bin", "", &[3u8; 10]).unwrap();
        vault.delete(stale.id).unwrap();
        let fresh = vault.store(folder, "b.bin", "", &[2u8; 100]).unwrap();
        assert_eq!(fresh.offset, stale.offset);

        // A reader holding the old record sees the new ciphertext.
        assert!(matches!(vault.read_live(&stale), Err(Error::NotFound(_))));
        assert_eq!(vault.read_live(&fresh).unwrap(), vec![2u8; 100]);
    }

    #[test]
    fn test_unique_path_strips_directories() {
        let out = tempfile::tempdir().unwrap();
        let path = unique_path(out.path(), "../../etc/passwd", 1);
        assert_eq!(path, out.path().join("passwd"));
        assert_eq!(unique_path(out.path(), "..", 4), out.path().join("file-4"));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Store(usize),
        Delete(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0usize..600).prop_map(Op::Store),
            2 => any::<usize>().prop_map(Op::Delete),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_live_ranges_never_overlap(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let dir = tempfile::tempdir().unwrap();
            let (vault, folder) = unlocked_vault(&dir);
            let mut live: Vec<(i64, Vec<u8>)> = Vec::new();

            for (step, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Store(size) => {
                        let data = vec![(step % 251) as u8; size];
                        let record = vault.store(folder, "f.bin", "application/octet-stream", &data).unwrap();
                        live.push((record.id, data));
                    }
                    Op::Delete(pick) => {
                        if !live.is_empty() {
                            let (id, _) = live.remove(pick % live.len());
                            vault.delete(id).unwrap();
                        }
                    }
                }
                assert_no_overlap(&vault);
            }

            for (id, data) in &live {
                prop_assert_eq!(&vault.fetch(*id).unwrap(), data);
            }
        }
    }
}
