//! Byte-range storage in the container body with free-space reuse.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::header::HEADER_SIZE;
use crate::index::IndexTx;
use lanvault_common::{Error, Result};

/// Positioned reader/writer over the body region of the container.
///
/// Allocation state lives in the index; every call that changes it takes
/// the caller's [`IndexTx`] so the allocation commits or rolls back with
/// the metadata that references it.
pub struct BlobStore {
    path: PathBuf,
}

impl BlobStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Current end of the body region (never inside the header).
    pub fn end_offset(&self) -> Result<u64> {
        let len = std::fs::metadata(&self.path)?.len();
        Ok(len.max(HEADER_SIZE as u64))
    }

    /// Reserve `length` bytes and return their offset.
    ///
    /// Best fit: the smallest free entry that is large enough is consumed
    /// (deleted on exact match, shrunk from the front otherwise). With no
    /// fitting entry the range is appended at the end of the body.
    ///
    /// # Preconditions
    /// - The caller serializes allocations (holds the index lock)
    pub fn allocate(&self, tx: &IndexTx<'_>, length: u64) -> Result<u64> {
        if length == 0 {
            return Err(Error::InvalidInput("Cannot allocate zero bytes".to_string()));
        }

        if let Some(space) = tx.find_free_space(length)? {
            if space.length == length {
                tx.delete_free_space(space.id)?;
            } else {
                tx.shrink_free_space(space.id, length)?;
            }
            debug!(offset = space.offset, length, reused = true, "Allocated range");
            return Ok(space.offset);
        }

        let offset = self.end_offset()?;
        debug!(offset, length, reused = false, "Allocated range");
        Ok(offset)
    }

    /// Return a range to the free pool. Adjacent entries are not merged.
    pub fn free(&self, tx: &IndexTx<'_>, offset: u64, length: u64) -> Result<()> {
        if offset < HEADER_SIZE as u64 || length == 0 {
            return Err(Error::StorageCorruption(format!(
                "Refusing to free range {}+{}",
                offset, length
            )));
        }
        tx.insert_free_space(offset, length)?;
        debug!(offset, length, "Freed range");
        Ok(())
    }

    /// Write `data` at `offset` and flush it to disk.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if offset < HEADER_SIZE as u64 {
            return Err(Error::StorageCorruption(format!(
                "Write at {} would overwrite the header",
                offset
            )));
        }

        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.sync_data()?;
        Ok(())
    }

    /// Read exactly `length` bytes at `offset`.
    ///
    /// # Errors
    /// - `StorageCorruption` if the range extends past the end of the file
    pub fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let len = usize::try_from(length)
            .map_err(|_| Error::StorageCorruption(format!("Blob length {} too large", length)))?;

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::StorageCorruption(format!(
                    "Range {}+{} extends past end of vault",
                    offset, length
                ))
            } else {
                Error::Io(e)
            }
        })?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::VaultIndex;

    fn setup() -> (tempfile::TempDir, BlobStore, VaultIndex) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.tvault");
        std::fs::write(&path, vec![0u8; HEADER_SIZE]).unwrap();
        (dir, BlobStore::new(&path), VaultIndex::in_memory().unwrap())
    }

    #[test]
    fn test_first_allocation_follows_header() {
        let (_dir, blobs, mut index) = setup();
        let tx = index.begin().unwrap();
        assert_eq!(blobs.allocate(&tx, 10).unwrap(), HEADER_SIZE as u64);
    }

    #[test]
    fn test_write_then_read() {
        let (_dir, blobs, mut index) = setup();
        let tx = index.begin().unwrap();
        let offset = blobs.allocate(&tx, 5).unwrap();
        blobs.write_at(offset, b"hello").unwrap();
        assert_eq!(blobs.read_at(offset, 5).unwrap(), b"hello");
        assert_eq!(blobs.end_offset().unwrap(), offset + 5);
    }

    #[test]
    fn test_freed_range_is_reused() {
        let (_dir, blobs, mut index) = setup();
        let tx = index.begin().unwrap();
        let a = blobs.allocate(&tx, 100).unwrap();
        blobs.write_at(a, &[1u8; 100]).unwrap();
        let b = blobs.allocate(&tx, 50).unwrap();
        blobs.write_at(b, &[2u8; 50]).unwrap();

        blobs.free(&tx, a, 100).unwrap();
        let end = blobs.end_offset().unwrap();

        let c = blobs.allocate(&tx, 60).unwrap();
        assert_eq!(c, a);
        assert_eq!(blobs.end_offset().unwrap(), end);

        // Remainder of the shrunk entry is still available.
        let d = blobs.allocate(&tx, 40).unwrap();
        assert_eq!(d, a + 60);
        assert!(tx.find_free_space(1).unwrap().is_none());
    }

    #[test]
    fn test_best_fit_prefers_smallest_entry() {
        let (_dir, blobs, mut index) = setup();
        let tx = index.begin().unwrap();
        blobs.write_at(HEADER_SIZE as u64, &[0u8; 1000]).unwrap();
        blobs.free(&tx, 300, 200).unwrap();
        blobs.free(&tx, 600, 80).unwrap();

        assert_eq!(blobs.allocate(&tx, 70).unwrap(), 600);
        assert_eq!(blobs.allocate(&tx, 70).unwrap(), 300);
    }

    #[test]
    fn test_allocation_rolls_back_with_transaction() {
        let (_dir, blobs, mut index) = setup();
        {
            let tx = index.begin().unwrap();
            blobs.free(&tx, 300, 200).unwrap();
            tx.commit().unwrap();
        }
        {
            let tx = index.begin().unwrap();
            assert_eq!(blobs.allocate(&tx, 200).unwrap(), 300);
        }
        assert_eq!(index.free_spaces().unwrap().len(), 1);
    }

    #[test]
    fn test_read_past_end_is_corrupt() {
        let (_dir, blobs, _index) = setup();
        assert!(matches!(
            blobs.read_at(HEADER_SIZE as u64, 10),
            Err(Error::StorageCorruption(_))
        ));
    }

    #[test]
    fn test_header_region_protected() {
        let (_dir, blobs, mut index) = setup();
        assert!(blobs.write_at(10, b"x").is_err());
        let tx = index.begin().unwrap();
        assert!(blobs.free(&tx, 0, 10).is_err());
    }
}
