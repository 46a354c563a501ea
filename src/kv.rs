//! Key-value environment shared by the stores.
//!
//! # Design Notes
//! - One embedded B+tree environment (`redb`) holds the four named tables:
//!   hash, source-id, source-data, and source-name. The backend gives ACID
//!   single-writer / multi-reader transactions where readers never block the
//!   writer, and it grows the map file on demand while preserving all data.
//! - Write transactions run with durability off; the host application
//!   accepts a power-loss window in exchange for ingestion throughput.
//!   Every [`SYNC_HINT_INTERVAL`] record writes, an advisory durable commit
//!   bounds the dirty-page backlog. Its failure is logged and ignored.
//! - Read-only handles refuse write transactions at this layer; the mode is
//!   fixed when the environment is opened.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use redb::{
    Database, Durability, MultimapTableDefinition, ReadTransaction, ReadableTableMetadata,
    TableDefinition, WriteTransaction,
};

use crate::error::{Error, Result};
use crate::settings::STORE_FILENAME;

/// Block-hash -> encoded occurrence, one pair per occurrence.
pub const HASH_TABLE: MultimapTableDefinition<&[u8], &[u8]> =
    MultimapTableDefinition::new("hash_store");

/// Encoded (repository, filename) -> source-id.
pub const SOURCE_ID_TABLE: TableDefinition<&[u8], u64> = TableDefinition::new("source_id_store");

/// Source-id -> encoded source-data record.
pub const SOURCE_DATA_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("source_data_store");

/// Source-id -> encoded (repository, filename), one pair per name.
pub const SOURCE_NAME_TABLE: MultimapTableDefinition<u64, &[u8]> =
    MultimapTableDefinition::new("source_name_store");

/// Store-internal bookkeeping, currently only the source-id allocator.
pub const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Meta key holding the last assigned source-id.
pub const META_LAST_SOURCE_ID: &str = "last_source_id";

/// Record writes between advisory durable commits.
pub const SYNC_HINT_INTERVAL: u64 = 10_000_000;

/// Open mode fixed for the lifetime of an environment handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileMode {
    ReadOnly,
    ReadWrite,
}

/// Entry counts per table, as reported by the `size` command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreCounts {
    /// Total stored occurrences (hash/value pairs, not distinct hashes).
    pub hash_records: u64,
    /// Number of (repository, filename) -> source-id entries.
    pub source_ids: u64,
    /// Number of source-data records.
    pub source_datas: u64,
    /// Number of source-id -> name pairs.
    pub source_names: u64,
}

/// Memory-mapped transactional environment holding the named tables.
pub struct StoreEnv {
    db: Database,
    mode: FileMode,
    writes_since_sync: AtomicU64,
}

impl StoreEnv {
    /// Creates the store file with all tables present and empty.
    pub fn create(dir: &Path) -> Result<Self> {
        let path = dir.join(STORE_FILENAME);
        if path.exists() {
            return Err(Error::User(format!(
                "store file '{}' already exists",
                path.display()
            )));
        }
        let db = Database::create(&path)?;
        let txn = db.begin_write()?;
        {
            txn.open_multimap_table(HASH_TABLE)?;
            txn.open_table(SOURCE_ID_TABLE)?;
            txn.open_table(SOURCE_DATA_TABLE)?;
            txn.open_multimap_table(SOURCE_NAME_TABLE)?;
            txn.open_table(META_TABLE)?;
        }
        txn.commit()?;
        Ok(Self {
            db,
            mode: FileMode::ReadWrite,
            writes_since_sync: AtomicU64::new(0),
        })
    }

    /// Opens an existing store file.
    pub fn open(dir: &Path, mode: FileMode) -> Result<Self> {
        let path = dir.join(STORE_FILENAME);
        if !path.is_file() {
            return Err(Error::User(format!(
                "'{}' is not a hash database: missing {STORE_FILENAME}",
                dir.display()
            )));
        }
        let db = Database::open(&path)?;
        Ok(Self {
            db,
            mode,
            writes_since_sync: AtomicU64::new(0),
        })
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    /// Begins a write transaction with synchronous durability off: commits
    /// reach the OS page cache but are not fsynced. This is the sync-off /
    /// write-map trade; the power-loss window is accepted for throughput.
    pub fn begin_write(&self) -> Result<WriteTransaction> {
        if self.mode == FileMode::ReadOnly {
            return Err(Error::User(
                "database is open read-only; reopen for modify to write".into(),
            ));
        }
        let mut txn = self.db.begin_write()?;
        txn.set_durability(Durability::Eventual);
        Ok(txn)
    }

    /// Begins a read transaction. Wait-free with respect to the writer.
    pub fn begin_read(&self) -> Result<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    /// Accounts `n` committed record writes and, when the interval rolls
    /// over, issues the advisory durable commit.
    pub fn note_writes(&self, n: u64) {
        let before = self.writes_since_sync.fetch_add(n, Ordering::Relaxed);
        if before / SYNC_HINT_INTERVAL != (before + n) / SYNC_HINT_INTERVAL {
            self.sync_hint();
        }
    }

    /// Durably commits an empty transaction to flush the dirty-page backlog.
    /// Failures are ignored; the sync is a convenience.
    fn sync_hint(&self) {
        tracing::debug!("issuing advisory durable sync");
        if let Err(err) = self.sync_durable() {
            tracing::debug!("advisory sync failed (ignored): {err}");
        }
    }

    /// Durably flushes all prior commits to disk. Called when a writer
    /// closes; closure must leave the map file flushed.
    pub fn sync_durable(&self) -> Result<()> {
        let mut txn = self.db.begin_write()?;
        txn.set_durability(Durability::Immediate);
        txn.commit()?;
        Ok(())
    }

    /// Entry counts for every table.
    pub fn counts(&self) -> Result<StoreCounts> {
        let txn = self.begin_read()?;
        Ok(StoreCounts {
            hash_records: txn.open_multimap_table(HASH_TABLE)?.len()?,
            source_ids: txn.open_table(SOURCE_ID_TABLE)?.len()?,
            source_datas: txn.open_table(SOURCE_DATA_TABLE)?.len()?,
            source_names: txn.open_multimap_table(SOURCE_NAME_TABLE)?.len()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::ReadableTable;

    #[test]
    fn create_then_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let env = StoreEnv::create(dir.path()).unwrap();
            let txn = env.begin_write().unwrap();
            {
                let mut t = txn.open_table(SOURCE_ID_TABLE).unwrap();
                t.insert(b"key".as_slice(), 7u64).unwrap();
            }
            txn.commit().unwrap();
        }
        let env = StoreEnv::open(dir.path(), FileMode::ReadOnly).unwrap();
        let txn = env.begin_read().unwrap();
        let t = txn.open_table(SOURCE_ID_TABLE).unwrap();
        assert_eq!(t.get(b"key".as_slice()).unwrap().unwrap().value(), 7);
    }

    #[test]
    fn create_refuses_existing_store() {
        let dir = tempfile::tempdir().unwrap();
        drop(StoreEnv::create(dir.path()).unwrap());
        assert!(StoreEnv::create(dir.path()).is_err());
    }

    #[test]
    fn read_only_mode_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        drop(StoreEnv::create(dir.path()).unwrap());
        let env = StoreEnv::open(dir.path(), FileMode::ReadOnly).unwrap();
        match env.begin_write() {
            Err(Error::User(msg)) => assert!(msg.contains("read-only")),
            Err(other) => panic!("expected user error, got {other:?}"),
            Ok(_) => panic!("expected user error, got Ok"),
        }
    }

    #[test]
    fn open_missing_store_is_a_user_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            StoreEnv::open(dir.path(), FileMode::ReadOnly),
            Err(Error::User(_))
        ));
    }

    #[test]
    fn counts_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let env = StoreEnv::create(dir.path()).unwrap();
        assert_eq!(env.counts().unwrap(), StoreCounts::default());
    }

    #[test]
    fn sync_hint_interval_rollover_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let env = StoreEnv::create(dir.path()).unwrap();
        // Exercise the accounting path across a forced rollover.
        env.writes_since_sync
            .store(SYNC_HINT_INTERVAL - 1, Ordering::Relaxed);
        env.note_writes(2);
        assert_eq!(
            env.writes_since_sync.load(Ordering::Relaxed),
            SYNC_HINT_INTERVAL + 1
        );
    }
}
