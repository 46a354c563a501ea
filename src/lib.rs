//! Content-addressed block-hash database with a parallel media scanner.
//!
//! The database ingests cryptographic hashes of fixed-size media blocks
//! together with the sources and byte offsets they were seen at, stores
//! them in an embedded transactional store fronted by a Bloom filter, and
//! answers two query shapes: "have I seen this block hash?" and "which
//! sources contain it, at what offsets?". The scanner streams a media
//! image through sliding windows on a worker pool to recognize previously
//! catalogued blocks at line rate, descending into recognized embedded
//! containers up to a bounded depth.
//!
//! # Layout
//!
//! ```text
//! <hashdb>/
//!   settings.json   create-time invariants (frozen)
//!   bloom           raw bitset, memory-mapped
//!   store.redb      hash / source-id / source-data / source-name tables
//! ```
//!
//! # Handle lifecycle
//!
//! A database moves through create -> open-for-read | open-for-modify ->
//! closed. [`HashDb::create`] builds the directory and returns; opening
//! yields a handle fixed to one mode ([`HashDb::open_read`] any number of
//! times, [`HashDb::open_modify`] at most one writer), and dropping the
//! handle closes it, flushing the map file. A handle never switches modes;
//! close and reopen instead.

pub mod bloom;
pub mod cli;
pub mod codec;
pub mod error;
pub mod hasher;
pub mod import;
pub mod import_tab;
pub mod kv;
pub mod ops;
pub mod rand_hash;
pub mod scan;
pub mod server;
pub mod settings;
pub mod store;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use error::{Error, Result};
pub use import::{ImportManager, ImportStats};
pub use scan::{ExpandedRecord, ScanManager, ScanMode};
pub use settings::{DigestAlgorithm, Settings};
pub use store::{InsertResult, InvalidArgKind, Occurrence};

use bloom::BloomFilter;
use kv::{FileMode, StoreCounts, StoreEnv};
use store::source_data_store::SourceData;

/// Bloom geometry for [`HashDb::rebuild_bloom`].
#[derive(Clone, Copy, Debug)]
pub struct BloomGeometry {
    pub enabled: bool,
    pub k: u32,
    pub bits: u64,
}

/// An open hash database: settings, environment, and directory.
pub struct HashDb {
    dir: PathBuf,
    settings: Settings,
    env: Arc<StoreEnv>,
}

impl HashDb {
    /// Creates a new database directory with the given settings.
    ///
    /// The directory must not already hold a database. Settings are
    /// written exactly once, here.
    pub fn create(dir: &Path, settings: Settings) -> Result<()> {
        settings.validate()?;
        if dir.join(settings::SETTINGS_FILENAME).exists() {
            return Err(Error::User(format!(
                "'{}' is already a hash database",
                dir.display()
            )));
        }
        fs::create_dir_all(dir)?;
        settings.write(dir)?;
        let env = StoreEnv::create(dir)?;
        env.sync_durable()?;
        BloomFilter::create(dir, &settings)?;
        tracing::info!(
            "created hash database '{}' (block size {}, {})",
            dir.display(),
            settings.block_size,
            settings.digest_algorithm.name()
        );
        Ok(())
    }

    /// Opens for reading. Any number of readers may coexist.
    pub fn open_read(dir: &Path) -> Result<Self> {
        Self::open(dir, FileMode::ReadOnly, None, None)
    }

    /// Opens for modification. At most one writer; the front-end holds the
    /// OS-level lock that enforces this across processes.
    pub fn open_modify(dir: &Path) -> Result<Self> {
        Self::open(dir, FileMode::ReadWrite, None, None)
    }

    /// Opens for modification, refusing when the stored geometry disagrees
    /// with what the caller asked for.
    pub fn open_modify_checked(
        dir: &Path,
        block_size: Option<u32>,
        algorithm: Option<DigestAlgorithm>,
    ) -> Result<Self> {
        Self::open(dir, FileMode::ReadWrite, block_size, algorithm)
    }

    fn open(
        dir: &Path,
        mode: FileMode,
        block_size: Option<u32>,
        algorithm: Option<DigestAlgorithm>,
    ) -> Result<Self> {
        let settings = Settings::read(dir)?;
        settings.check_request(block_size, algorithm)?;
        let env = Arc::new(StoreEnv::open(dir, mode)?);
        Ok(Self {
            dir: dir.to_path_buf(),
            settings,
            env,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The coordinated write path. Requires an open-for-modify handle.
    pub fn import_manager(&self) -> Result<ImportManager> {
        if self.env.mode() != FileMode::ReadWrite {
            return Err(Error::User(
                "database is open read-only; reopen for modify to import".into(),
            ));
        }
        ImportManager::new(&self.dir, self.settings.clone(), Arc::clone(&self.env))
    }

    /// The read path. Many managers may share one handle; each serializes
    /// only its own mutable state.
    pub fn scan_manager(&self) -> Result<ScanManager> {
        ScanManager::new(&self.dir, self.settings.clone(), Arc::clone(&self.env))
    }

    /// Per-table entry counts.
    pub fn counts(&self) -> Result<StoreCounts> {
        self.env.counts()
    }

    /// Number of distinct block hashes. Walks the hash table.
    pub fn distinct_hash_count(&self) -> Result<u64> {
        store::hash_store::distinct_hash_count(&self.env)
    }

    /// Visits every stored block hash with its occurrences.
    pub fn for_each_hash<F>(&self, visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[Occurrence]) -> Result<()>,
    {
        store::hash_store::for_each(&self.env, self.settings.block_size, visit)
    }

    /// Visits every source-data record.
    pub fn for_each_source<F>(&self, visit: F) -> Result<()>
    where
        F: FnMut(u64, &SourceData) -> Result<()>,
    {
        store::source_data_store::for_each(&self.env, self.settings.digest_len as usize, visit)
    }

    /// Every (repository, filename) recorded for a source.
    pub fn source_names(&self, source_id: u64) -> Result<Vec<(String, String)>> {
        store::source_id_store::names_of(&self.env, source_id)
    }

    /// Source-data record for one source.
    pub fn source_data(&self, source_id: u64) -> Result<Option<SourceData>> {
        store::source_data_store::find(&self.env, self.settings.digest_len as usize, source_id)
    }

    /// Rebuilds the Bloom filter from the hash store, optionally with new
    /// geometry.
    ///
    /// The bit array is a cache of the hash table, so regenerating it (and
    /// its geometry fields in the settings file) does not touch the frozen
    /// data-model settings. Rebuilding twice with the same geometry yields
    /// bitwise identical files.
    pub fn rebuild_bloom(&mut self, geometry: Option<BloomGeometry>) -> Result<()> {
        if self.env.mode() != FileMode::ReadWrite {
            return Err(Error::User(
                "database is open read-only; reopen for modify to rebuild".into(),
            ));
        }
        let geometry = geometry.unwrap_or(BloomGeometry {
            enabled: self.settings.bloom_enabled,
            k: self.settings.bloom_k,
            bits: self.settings.bloom_bits,
        });

        let mut settings = self.settings.clone();
        settings.bloom_enabled = geometry.enabled;
        settings.bloom_k = geometry.k;
        settings.bloom_bits = geometry.bits;
        settings.validate()?;

        let bloom_path = self.dir.join(settings::BLOOM_FILENAME);
        if bloom_path.exists() {
            fs::remove_file(&bloom_path)?;
        }
        let mut bloom = BloomFilter::create(&self.dir, &settings)?;
        if settings.bloom_enabled {
            let mut added = 0u64;
            store::hash_store::for_each(&self.env, settings.block_size, |hash, _| {
                bloom.add(hash);
                added += 1;
                Ok(())
            })?;
            tracing::info!("bloom rebuilt over {added} distinct hashes");
        }
        bloom.flush()?;
        settings.write(&self.dir)?;
        self.settings = settings;
        Ok(())
    }
}
