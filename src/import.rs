//! Import manager: the coordinated write path.
//!
//! One manager wraps the three stores and the Bloom filter behind the
//! operations an importer needs: assign source-ids, record names and
//! source data, and insert block-hash occurrences with cap enforcement.
//! The manager is single-writer by construction (`&mut self` on every
//! mutating call); concurrent imports across processes are undefined
//! behavior, and the on-disk layout carries no lock to prevent them. The
//! front-end is expected to hold an OS-level lock file.
//!
//! Closing the manager durably flushes both the environment and the Bloom
//! bit array.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::bloom::BloomFilter;
use crate::error::{Error, Result};
use crate::kv::StoreEnv;
use crate::settings::Settings;
use crate::store::source_data_store::{self, SourceData};
use crate::store::source_id_store;
use crate::store::{hash_store, InsertResult, InvalidArgKind, Occurrence};

/// Repository name used when a source is identified only by its file hash.
/// The filename slot then carries the hex digest.
pub const FILE_HASH_REPOSITORY: &str = "$file-hash";

/// Running counters for one import session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// New source-ids assigned.
    pub sources_inserted: u64,
    /// Occurrences stored.
    pub hashes_inserted: u64,
    /// Occurrences past the per-hash cap, counted but not stored.
    pub hashes_dropped: u64,
    /// Insertions rejected by argument validation.
    pub hashes_invalid: u64,
}

impl fmt::Display for ImportStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sources: {}, hashes inserted: {}, dropped: {}, invalid: {}",
            self.sources_inserted, self.hashes_inserted, self.hashes_dropped, self.hashes_invalid
        )
    }
}

/// Coordinated writer over the stores and the Bloom filter.
pub struct ImportManager {
    env: Arc<StoreEnv>,
    bloom: BloomFilter,
    settings: Settings,
    stats: ImportStats,
}

impl ImportManager {
    /// Opens the write path for a database. The environment must be open
    /// for modify.
    pub fn new(dir: &Path, settings: Settings, env: Arc<StoreEnv>) -> Result<Self> {
        let bloom = BloomFilter::open(dir, &settings, true)?;
        Ok(Self {
            env,
            bloom,
            settings,
            stats: ImportStats::default(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stats(&self) -> ImportStats {
        self.stats
    }

    /// Returns the id for a (repository, filename) source, assigning the
    /// next dense id when the name is unknown.
    pub fn insert_source_by_name(
        &mut self,
        repository: &str,
        filename: &str,
    ) -> Result<(bool, u64)> {
        let (is_new, id) = source_id_store::insert_or_get(&self.env, repository, filename)?;
        if is_new {
            self.stats.sources_inserted += 1;
        }
        Ok((is_new, id))
    }

    /// Returns the id for a source known only by its file hash, using a
    /// synthetic repository key so identical files deduplicate across
    /// repositories.
    pub fn insert_source_id(&mut self, file_binary_hash: &[u8]) -> Result<(bool, u64)> {
        if file_binary_hash.len() != self.settings.digest_len as usize {
            return Err(Error::User(format!(
                "file hash is {} bytes, database digest length is {}",
                file_binary_hash.len(),
                self.settings.digest_len
            )));
        }
        self.insert_source_by_name(FILE_HASH_REPOSITORY, &hex::encode(file_binary_hash))
    }

    /// Records `(repository, filename)` as a name of `source_id`.
    pub fn insert_source_name(
        &mut self,
        source_id: u64,
        repository: &str,
        filename: &str,
    ) -> Result<()> {
        source_id_store::insert_name(&self.env, source_id, repository, filename)?;
        Ok(())
    }

    /// Records file-level metadata for `source_id`. Last write wins;
    /// callers should write once, on first observation.
    pub fn insert_source_data(
        &mut self,
        source_id: u64,
        file_hash: &[u8],
        filesize: u64,
        file_type: &str,
        non_probative_count: u64,
    ) -> Result<()> {
        if file_hash.len() != self.settings.digest_len as usize {
            return Err(Error::User(format!(
                "file hash is {} bytes, database digest length is {}",
                file_hash.len(),
                self.settings.digest_len
            )));
        }
        let data = SourceData {
            file_hash: file_hash.to_vec(),
            filesize,
            file_type: file_type.to_owned(),
            non_probative_count,
        };
        source_data_store::insert(&self.env, source_id, &data)?;
        Ok(())
    }

    /// Inserts one block-hash occurrence.
    ///
    /// `entropy` and `block_context` describe the block for downstream
    /// classifiers; only the entropy label is persisted with the
    /// occurrence. Offsets must be block-aligned and the hash must have the
    /// settings digest length; violations report `InvalidArg` without
    /// writing.
    pub fn insert_hash(
        &mut self,
        block_hash: &[u8],
        source_id: u64,
        file_offset: u64,
        entropy_label: &str,
        entropy: u64,
        block_context: &str,
    ) -> Result<InsertResult> {
        if block_hash.len() != self.settings.digest_len as usize {
            self.stats.hashes_invalid += 1;
            return Ok(InsertResult::InvalidArg(InvalidArgKind::BadHashLength));
        }
        if file_offset % u64::from(self.settings.block_size) != 0 {
            self.stats.hashes_invalid += 1;
            return Ok(InsertResult::InvalidArg(InvalidArgKind::UnalignedOffset));
        }
        let _ = (entropy, block_context);

        let occurrence = Occurrence {
            source_id,
            file_offset,
            entropy_label: entropy_label.to_owned(),
        };
        let result = hash_store::insert(
            &self.env,
            self.settings.block_size,
            self.settings.max_duplicates,
            block_hash,
            &occurrence,
        )?;
        match &result {
            InsertResult::Inserted(_) => {
                self.bloom.add(block_hash);
                self.stats.hashes_inserted += 1;
            }
            InsertResult::Dropped(_) => self.stats.hashes_dropped += 1,
            InsertResult::InvalidArg(_) => self.stats.hashes_invalid += 1,
        }
        Ok(result)
    }

    /// Durably flushes the environment and the Bloom bit array.
    pub fn flush(&self) -> Result<()> {
        self.env.sync_durable()?;
        self.bloom.flush()
    }
}

impl Drop for ImportManager {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::warn!("flush on import close failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{DigestAlgorithm, FORMAT_VERSION};

    fn test_settings(max_duplicates: u32) -> Settings {
        Settings {
            format_version: FORMAT_VERSION,
            block_size: 512,
            digest_algorithm: DigestAlgorithm::Md5,
            digest_len: 16,
            max_duplicates,
            bloom_enabled: true,
            bloom_k: 3,
            bloom_bits: 1 << 16,
        }
    }

    fn manager(dir: &Path, max_duplicates: u32) -> ImportManager {
        let settings = test_settings(max_duplicates);
        let env = Arc::new(StoreEnv::create(dir).unwrap());
        BloomFilter::create(dir, &settings).unwrap();
        ImportManager::new(dir, settings, env).unwrap()
    }

    #[test]
    fn insert_then_find_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(dir.path(), 0);

        let (is_new, sid) = m.insert_source_by_name("R", "F").unwrap();
        assert!(is_new);
        m.insert_source_name(sid, "R", "F").unwrap();
        m.insert_source_data(sid, &[0x11; 16], 1024, "raw", 0).unwrap();

        let hash = [0xaa; 16];
        assert_eq!(
            m.insert_hash(&hash, sid, 1024, "", 0, "").unwrap(),
            InsertResult::Inserted(1)
        );
        let found = hash_store::find(&m.env, 512, &hash).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_id, sid);
        assert_eq!(found[0].file_offset, 1024);
        assert!(m.bloom.probe(&hash));
    }

    #[test]
    fn unaligned_offset_is_invalid_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(dir.path(), 0);
        let (_, sid) = m.insert_source_by_name("R", "F").unwrap();
        assert_eq!(
            m.insert_hash(&[0xaa; 16], sid, 513, "", 0, "").unwrap(),
            InsertResult::InvalidArg(InvalidArgKind::UnalignedOffset)
        );
        assert_eq!(m.stats().hashes_invalid, 1);
    }

    #[test]
    fn wrong_hash_length_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(dir.path(), 0);
        let (_, sid) = m.insert_source_by_name("R", "F").unwrap();
        assert_eq!(
            m.insert_hash(&[0xaa; 20], sid, 0, "", 0, "").unwrap(),
            InsertResult::InvalidArg(InvalidArgKind::BadHashLength)
        );
    }

    #[test]
    fn cap_is_reported_in_stats() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(dir.path(), 1);
        let (_, a) = m.insert_source_by_name("R", "A").unwrap();
        let (_, b) = m.insert_source_by_name("R", "B").unwrap();
        let hash = [0xee; 16];
        assert_eq!(
            m.insert_hash(&hash, a, 0, "", 0, "").unwrap(),
            InsertResult::Inserted(1)
        );
        assert_eq!(
            m.insert_hash(&hash, b, 0, "", 0, "").unwrap(),
            InsertResult::Dropped(1)
        );
        assert_eq!(m.stats().hashes_inserted, 1);
        assert_eq!(m.stats().hashes_dropped, 1);
    }

    #[test]
    fn file_hash_sources_deduplicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manager(dir.path(), 0);
        let file_hash = [0x42; 16];
        let (first_new, a) = m.insert_source_id(&file_hash).unwrap();
        let (second_new, b) = m.insert_source_id(&file_hash).unwrap();
        assert!(first_new);
        assert!(!second_new);
        assert_eq!(a, b);
    }
}
