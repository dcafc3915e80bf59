//! SQLite metadata store for folders, file records and free space.
//!
//! The container file has no in-file directory; every blob's location is
//! recorded here. Allocation and metadata writes share one SQLite
//! transaction through [`IndexTx`].

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use lanvault_common::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS folders (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    size INTEGER NOT NULL,
    folder_id INTEGER NOT NULL REFERENCES folders(id),
    mime_type TEXT NOT NULL,
    offset INTEGER NOT NULL,
    length INTEGER NOT NULL,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS free_spaces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    offset INTEGER NOT NULL,
    length INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_files_folder ON files(folder_id);
CREATE INDEX IF NOT EXISTS idx_free_spaces_length ON free_spaces(length);
"#;

const FILE_COLUMNS: &str =
    "id, uuid, name, size, mime_type, folder_id, offset, length, created_at, is_deleted";

/// Metadata for one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    /// Key-derivation input for this file; unique, not secret.
    pub uuid: String,
    pub name: String,
    /// Plaintext size.
    pub size: u64,
    pub mime_type: String,
    pub folder_id: i64,
    pub offset: u64,
    /// Ciphertext length on disk.
    pub length: u64,
    pub created_at: String,
    pub is_deleted: bool,
}

impl FileRecord {
    /// End of this record's byte range (exclusive).
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Folder with its number of live files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderInfo {
    pub id: i64,
    pub name: String,
    pub created_at: String,
    pub file_count: u64,
}

/// A reclaimed byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpace {
    pub id: i64,
    pub offset: u64,
    pub length: u64,
}

/// Fields supplied when inserting a file record.
#[derive(Debug, Clone)]
pub struct NewFile<'a> {
    pub uuid: &'a str,
    pub name: &'a str,
    pub size: u64,
    pub mime_type: &'a str,
    pub folder_id: i64,
    pub offset: u64,
    pub length: u64,
}

fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::InvalidInput(format!("Value {} exceeds storage range", value)))
}

fn from_sql_int(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        uuid: row.get(1)?,
        name: row.get(2)?,
        size: from_sql_int(row, 3)?,
        mime_type: row.get(4)?,
        folder_id: row.get(5)?,
        offset: from_sql_int(row, 6)?,
        length: from_sql_int(row, 7)?,
        created_at: row.get(8)?,
        is_deleted: row.get::<_, i64>(9)? != 0,
    })
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn live_file(conn: &Connection, id: i64) -> Result<Option<FileRecord>> {
    let sql = format!(
        "SELECT {} FROM files WHERE id = ?1 AND is_deleted = 0",
        FILE_COLUMNS
    );
    Ok(conn.query_row(&sql, [id], file_from_row).optional()?)
}

/// Metadata store handle.
pub struct VaultIndex {
    conn: Connection,
}

impl VaultIndex {
    /// Open or create the index database and apply the schema.
    ///
    /// # Errors
    /// - `Database` if the file cannot be opened or migrated
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        Self::from_connection(conn)
    }

    /// Create an in-memory index (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        info!("Vault index opened");
        Ok(Self { conn })
    }

    /// Return the id of the folder called `name`, creating it if needed.
    pub fn ensure_folder(&self, name: &str) -> Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("Folder name cannot be empty".to_string()));
        }
        self.conn.execute(
            "INSERT OR IGNORE INTO folders (name, created_at) VALUES (?1, ?2)",
            params![name, now()],
        )?;
        let id = self
            .conn
            .query_row("SELECT id FROM folders WHERE name = ?1", [name], |row| {
                row.get(0)
            })?;
        Ok(id)
    }

    /// Whether a folder with this id exists.
    pub fn folder_exists(&self, id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row("SELECT id FROM folders WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Live (not deleted) record by id.
    pub fn file_by_id(&self, id: i64) -> Result<Option<FileRecord>> {
        live_file(&self.conn, id)
    }

    /// All live files, oldest first.
    pub fn list_files(&self) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {} FROM files WHERE is_deleted = 0 ORDER BY id",
            FILE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Live files inside one folder.
    pub fn files_in_folder(&self, folder_id: i64) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {} FROM files WHERE is_deleted = 0 AND folder_id = ?1 ORDER BY id",
            FILE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([folder_id], file_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Folders with live file counts.
    pub fn list_folders(&self) -> Result<Vec<FolderInfo>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT f.id, f.name, f.created_at,
                   (SELECT COUNT(*) FROM files WHERE folder_id = f.id AND is_deleted = 0)
            FROM folders f
            ORDER BY f.name
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FolderInfo {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
                file_count: from_sql_int(row, 3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Current free-space entries ordered by offset.
    pub fn free_spaces(&self) -> Result<Vec<FreeSpace>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, offset, length FROM free_spaces ORDER BY offset")?;
        let rows = stmt.query_map([], |row| {
            Ok(FreeSpace {
                id: row.get(0)?,
                offset: from_sql_int(row, 1)?,
                length: from_sql_int(row, 2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Start a transaction for an allocation and its metadata.
    ///
    /// Dropping the returned handle without calling [`IndexTx::commit`]
    /// rolls every change back.
    pub fn begin(&mut self) -> Result<IndexTx<'_>> {
        Ok(IndexTx {
            tx: self.conn.transaction()?,
        })
    }
}

/// An open index transaction.
pub struct IndexTx<'a> {
    tx: Transaction<'a>,
}

impl IndexTx<'_> {
    /// Insert a file record and return its id.
    pub fn insert_file_metadata(&self, file: &NewFile<'_>) -> Result<i64> {
        let ts = now();
        self.tx.execute(
            r#"
            INSERT INTO files
            (uuid, name, size, folder_id, mime_type, offset, length, is_deleted, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
            "#,
            params![
                file.uuid,
                file.name,
                to_sql_int(file.size)?,
                file.folder_id,
                file.mime_type,
                to_sql_int(file.offset)?,
                to_sql_int(file.length)?,
                ts,
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Smallest free entry of at least `min_length` bytes.
    pub fn find_free_space(&self, min_length: u64) -> Result<Option<FreeSpace>> {
        let found = self
            .tx
            .query_row(
                r#"
                SELECT id, offset, length FROM free_spaces
                WHERE length >= ?1
                ORDER BY length ASC, offset ASC
                LIMIT 1
                "#,
                [to_sql_int(min_length)?],
                |row| {
                    Ok(FreeSpace {
                        id: row.get(0)?,
                        offset: from_sql_int(row, 1)?,
                        length: from_sql_int(row, 2)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    pub fn delete_free_space(&self, id: i64) -> Result<()> {
        self.tx
            .execute("DELETE FROM free_spaces WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Consume `used` bytes from the front of a free entry.
    pub fn shrink_free_space(&self, id: i64, used: u64) -> Result<()> {
        let used = to_sql_int(used)?;
        let changed = self.tx.execute(
            "UPDATE free_spaces SET offset = offset + ?2, length = length - ?2 WHERE id = ?1 AND length > ?2",
            params![id, used],
        )?;
        if changed != 1 {
            return Err(Error::StorageCorruption(format!(
                "Free space entry {} cannot be shrunk by {} bytes",
                id, used
            )));
        }
        Ok(())
    }

    pub fn insert_free_space(&self, offset: u64, length: u64) -> Result<i64> {
        self.tx.execute(
            "INSERT INTO free_spaces (offset, length) VALUES (?1, ?2)",
            params![to_sql_int(offset)?, to_sql_int(length)?],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Live record by id, seen from inside the transaction.
    pub fn file_by_id(&self, id: i64) -> Result<Option<FileRecord>> {
        live_file(&self.tx, id)
    }

    /// Flag a live record as deleted.
    ///
    /// # Errors
    /// - `NotFound` if the record is unknown or already deleted
    pub fn mark_deleted(&self, id: i64) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE files SET is_deleted = 1, updated_at = ?2 WHERE id = ?1 AND is_deleted = 0",
            params![id, now()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("File {} not found", id)));
        }
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        debug!("Index transaction committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(uuid: &str, folder_id: i64, offset: u64, length: u64) -> NewFile<'_> {
        NewFile {
            uuid,
            name: "a.txt",
            size: 5,
            mime_type: "text/plain",
            folder_id,
            offset,
            length,
        }
    }

    #[test]
    fn test_ensure_folder_is_idempotent() {
        let index = VaultIndex::in_memory().unwrap();
        let a = index.ensure_folder("Received").unwrap();
        let b = index.ensure_folder("Received").unwrap();
        assert_eq!(a, b);
        assert!(index.folder_exists(a).unwrap());
        assert!(!index.folder_exists(a + 100).unwrap());
        assert!(index.ensure_folder("  ").is_err());
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut index = VaultIndex::in_memory().unwrap();
        let folder = index.ensure_folder("Received").unwrap();

        let tx = index.begin().unwrap();
        let id = tx.insert_file_metadata(&sample("u1", folder, 256, 45)).unwrap();
        tx.commit().unwrap();

        let record = index.file_by_id(id).unwrap().unwrap();
        assert_eq!(record.uuid, "u1");
        assert_eq!(record.offset, 256);
        assert_eq!(record.end(), 301);
        assert!(!record.is_deleted);
    }

    #[test]
    fn test_rollback_on_drop() {
        let mut index = VaultIndex::in_memory().unwrap();
        let folder = index.ensure_folder("Received").unwrap();

        {
            let tx = index.begin().unwrap();
            tx.insert_file_metadata(&sample("u1", folder, 256, 45)).unwrap();
            tx.insert_free_space(1000, 10).unwrap();
        }

        assert!(index.list_files().unwrap().is_empty());
        assert!(index.free_spaces().unwrap().is_empty());
    }

    #[test]
    fn test_best_fit_selection() {
        let mut index = VaultIndex::in_memory().unwrap();
        let tx = index.begin().unwrap();
        tx.insert_free_space(1000, 500).unwrap();
        tx.insert_free_space(2000, 100).unwrap();
        tx.insert_free_space(3000, 60).unwrap();

        let hit = tx.find_free_space(80).unwrap().unwrap();
        assert_eq!((hit.offset, hit.length), (2000, 100));
        assert!(tx.find_free_space(501).unwrap().is_none());
    }

    #[test]
    fn test_shrink_free_space() {
        let mut index = VaultIndex::in_memory().unwrap();
        let tx = index.begin().unwrap();
        let id = tx.insert_free_space(1000, 100).unwrap();
        tx.shrink_free_space(id, 40).unwrap();
        assert!(tx.shrink_free_space(id, 60).is_err());
        tx.commit().unwrap();

        assert_eq!(
            index.free_spaces().unwrap(),
            vec![FreeSpace {
                id,
                offset: 1040,
                length: 60
            }]
        );
    }

    #[test]
    fn test_mark_deleted_hides_record() {
        let mut index = VaultIndex::in_memory().unwrap();
        let folder = index.ensure_folder("Received").unwrap();
        let tx = index.begin().unwrap();
        let id = tx.insert_file_metadata(&sample("u1", folder, 256, 45)).unwrap();
        tx.commit().unwrap();

        let tx = index.begin().unwrap();
        tx.mark_deleted(id).unwrap();
        assert!(matches!(tx.mark_deleted(id), Err(Error::NotFound(_))));
        tx.commit().unwrap();

        assert!(index.file_by_id(id).unwrap().is_none());
        assert!(index.list_files().unwrap().is_empty());
    }

    #[test]
    fn test_list_folders_counts_live_files() {
        let mut index = VaultIndex::in_memory().unwrap();
        let received = index.ensure_folder("Received").unwrap();
        let other = index.ensure_folder("Other").unwrap();

        let tx = index.begin().unwrap();
        let a = tx.insert_file_metadata(&sample("u1", received, 256, 10)).unwrap();
        tx.insert_file_metadata(&sample("u2", received, 266, 10)).unwrap();
        tx.mark_deleted(a).unwrap();
        tx.commit().unwrap();

        let folders = index.list_folders().unwrap();
        let count = |id| folders.iter().find(|f| f.id == id).unwrap().file_count;
        assert_eq!(count(received), 1);
        assert_eq!(count(other), 0);
        assert_eq!(index.files_in_folder(received).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let mut index = VaultIndex::in_memory().unwrap();
        let folder = index.ensure_folder("Received").unwrap();
        let tx = index.begin().unwrap();
        tx.insert_file_metadata(&sample("dup", folder, 256, 10)).unwrap();
        assert!(matches!(
            tx.insert_file_metadata(&sample("dup", folder, 266, 10)),
            Err(Error::Database(_))
        ));
    }
}
