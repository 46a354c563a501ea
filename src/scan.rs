//! Scan manager: the read path.
//!
//! Lookups go Bloom filter first, then the hash store, then (for expanded
//! queries) a join through the source-data and source-name stores. A
//! negative Bloom probe answers without touching the store at all, which is
//! what makes high-rate negative lookups cheap.
//!
//! One manager serializes its own mutable state behind a mutex, so a single
//! instance is safe to share across threads; scans that want real
//! concurrency create one manager per worker over the same environment.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::bloom::BloomFilter;
use crate::error::{Error, Result};
use crate::kv::StoreEnv;
use crate::settings::Settings;
use crate::store::{hash_store, source_data_store, source_id_store, Occurrence};

/// How much detail a media scan asks for per matched block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanMode {
    /// Occurrence count only.
    CountOnly,
    /// Full source expansion for every match.
    Expanded,
    /// Full source expansion the first time a hash is seen in this scan,
    /// count-only afterwards.
    ExpandedOptimized,
}

impl ScanMode {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "count_only" => Ok(ScanMode::CountOnly),
            "expanded" => Ok(ScanMode::Expanded),
            "expanded_optimized" => Ok(ScanMode::ExpandedOptimized),
            other => Err(Error::User(format!(
                "unknown scan_mode '{other}', expected count_only, expanded, or expanded_optimized"
            ))),
        }
    }
}

/// One source joined onto a matched block hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpandedSource {
    pub repository: String,
    pub filename: String,
    pub file_offset: u64,
    pub file_hash: Vec<u8>,
    pub filesize: u64,
    pub file_type: String,
}

/// Full provenance for a matched block hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpandedRecord {
    pub block_hash: Vec<u8>,
    pub total_count: u64,
    /// `None` when `total_count` exceeded the caller's source budget; the
    /// sources list is omitted to bound output size.
    pub sources: Option<Vec<ExpandedSource>>,
}

impl ExpandedRecord {
    /// JSON form used by scan output and the expanded CLI commands.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "block_hash": hex::encode(&self.block_hash),
            "count": self.total_count,
        });
        if let Some(sources) = &self.sources {
            let entries: Vec<serde_json::Value> = sources
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "repository": s.repository,
                        "filename": s.filename,
                        "file_offset": s.file_offset,
                        "file_hash": hex::encode(&s.file_hash),
                        "filesize": s.filesize,
                        "file_type": s.file_type,
                    })
                })
                .collect();
            obj["sources"] = serde_json::Value::Array(entries);
        }
        obj
    }
}

/// Read-only counterpart to the import manager.
pub struct ScanManager {
    env: Arc<StoreEnv>,
    bloom: BloomFilter,
    settings: Settings,
    expanded_seen: Mutex<HashSet<Vec<u8>>>,
}

impl ScanManager {
    /// Opens the read path for a database.
    pub fn new(dir: &Path, settings: Settings, env: Arc<StoreEnv>) -> Result<Self> {
        let bloom = BloomFilter::open(dir, &settings, false)?;
        Ok(Self {
            env,
            bloom,
            settings,
            expanded_seen: Mutex::new(HashSet::new()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn check_hash_len(&self, block_hash: &[u8]) -> Result<()> {
        if block_hash.len() != self.settings.digest_len as usize {
            return Err(Error::User(format!(
                "hash is {} bytes, database digest length is {}",
                block_hash.len(),
                self.settings.digest_len
            )));
        }
        Ok(())
    }

    /// Occurrence count for a block hash. Zero when the Bloom probe is
    /// negative.
    pub fn find_hash_count(&self, block_hash: &[u8]) -> Result<u64> {
        self.check_hash_len(block_hash)?;
        if !self.bloom.probe(block_hash) {
            return Ok(0);
        }
        hash_store::find_count(&self.env, block_hash)
    }

    /// All occurrences for a block hash. Empty when the Bloom probe is
    /// negative.
    pub fn find_hash(&self, block_hash: &[u8]) -> Result<Vec<Occurrence>> {
        self.check_hash_len(block_hash)?;
        if !self.bloom.probe(block_hash) {
            return Ok(Vec::new());
        }
        hash_store::find(&self.env, self.settings.block_size, block_hash)
    }

    /// Joins every occurrence of `block_hash` through the source stores.
    ///
    /// Returns `None` when the hash is absent. When the occurrence count
    /// exceeds `max_sources`, the sources list is omitted so one popular
    /// block cannot balloon the output.
    pub fn find_expanded_hash(
        &self,
        block_hash: &[u8],
        max_sources: u64,
    ) -> Result<Option<ExpandedRecord>> {
        let occurrences = self.find_hash(block_hash)?;
        if occurrences.is_empty() {
            return Ok(None);
        }
        let total_count = occurrences.len() as u64;
        if total_count > max_sources {
            return Ok(Some(ExpandedRecord {
                block_hash: block_hash.to_vec(),
                total_count,
                sources: None,
            }));
        }
        let mut sources = Vec::with_capacity(occurrences.len());
        for occurrence in &occurrences {
            sources.push(self.expand_occurrence(block_hash, occurrence)?);
        }
        Ok(Some(ExpandedRecord {
            block_hash: block_hash.to_vec(),
            total_count,
            sources: Some(sources),
        }))
    }

    fn expand_occurrence(
        &self,
        block_hash: &[u8],
        occurrence: &Occurrence,
    ) -> Result<ExpandedSource> {
        let digest_len = self.settings.digest_len as usize;
        let data = source_data_store::find(&self.env, digest_len, occurrence.source_id)?
            .ok_or_else(|| {
                Error::DataIntegrity(format!(
                    "hash {} references source-id {} with no source data",
                    hex::encode(block_hash),
                    occurrence.source_id
                ))
            })?;
        let mut names = source_id_store::names_of(&self.env, occurrence.source_id)?;
        names.sort();
        let (repository, filename) = names.into_iter().next().unwrap_or_default();
        Ok(ExpandedSource {
            repository,
            filename,
            file_offset: occurrence.file_offset,
            file_hash: data.file_hash,
            filesize: data.filesize,
            file_type: data.file_type,
        })
    }

    /// Marks a hash as seen for this scan. Returns true on first sighting.
    /// Drives the expanded-optimized mode.
    pub fn first_sighting(&self, block_hash: &[u8]) -> bool {
        self.expanded_seen
            .lock()
            .expect("expanded-seen mutex poisoned")
            .insert(block_hash.to_vec())
    }

    /// Forgets all expanded-optimized sightings, for a fresh scan.
    pub fn reset_sightings(&self) {
        self.expanded_seen
            .lock()
            .expect("expanded-seen mutex poisoned")
            .clear();
    }
}
