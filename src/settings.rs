//! Create-time database settings.
//!
//! Settings are written exactly once, when the database is created, into a
//! human-readable `settings.json` at the root of the database directory.
//! They are never mutated afterwards: the digest algorithm, block size,
//! occurrence cap, and Bloom geometry are frozen for the life of the
//! database. Opening refuses to proceed when the file is missing or when a
//! caller-requested block size or algorithm disagrees with what is stored.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings file name inside the database directory.
pub const SETTINGS_FILENAME: &str = "settings.json";
/// Bloom filter bitset file name inside the database directory.
pub const BLOOM_FILENAME: &str = "bloom";
/// Key-value environment file name inside the database directory.
pub const STORE_FILENAME: &str = "store.redb";

/// Current on-disk settings format version.
pub const FORMAT_VERSION: u32 = 1;

/// Digest algorithm fixed at database create time.
///
/// The algorithm also fixes the digest byte length; every block hash and
/// file hash in the database must have exactly that length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    /// Digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 16,
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
        }
    }

    /// Stable numeric id used by the query-server wire format.
    pub fn wire_id(self) -> u32 {
        match self {
            DigestAlgorithm::Md5 => 1,
            DigestAlgorithm::Sha1 => 2,
            DigestAlgorithm::Sha256 => 3,
        }
    }

    /// Parses a user-supplied algorithm name.
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "md5" => Ok(DigestAlgorithm::Md5),
            "sha1" | "sha-1" => Ok(DigestAlgorithm::Sha1),
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            other => Err(Error::User(format!(
                "unknown digest algorithm '{other}', expected md5, sha1, or sha256"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
        }
    }
}

/// Create-time invariants persisted alongside the stores.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// On-disk format version.
    pub format_version: u32,
    /// Block size in bytes. All imported file offsets are multiples of this.
    pub block_size: u32,
    /// Digest algorithm for block and file hashes.
    pub digest_algorithm: DigestAlgorithm,
    /// Digest length in bytes, redundant with the algorithm but persisted so
    /// a reader can validate hash lengths without algorithm knowledge.
    pub digest_len: u32,
    /// Maximum stored occurrences per block hash. 0 means unlimited.
    pub max_duplicates: u32,
    /// Whether the Bloom filter is consulted and maintained.
    pub bloom_enabled: bool,
    /// Number of Bloom hash functions.
    pub bloom_k: u32,
    /// Bloom bit-array size in bits. Power of two.
    pub bloom_bits: u64,
}

impl Settings {
    /// Validates the internal consistency of create-time settings.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::User("hash_block_size must be greater than 0".into()));
        }
        if self.digest_len as usize != self.digest_algorithm.digest_len() {
            return Err(Error::User(format!(
                "digest length {} does not match algorithm {}",
                self.digest_len,
                self.digest_algorithm.name()
            )));
        }
        if self.bloom_enabled {
            crate::bloom::validate_parameters(
                self.bloom_k,
                self.bloom_bits,
                self.digest_len as usize,
            )?;
        }
        Ok(())
    }

    /// Writes `settings.json` into the database directory. Create-time only.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Io(format!("cannot serialize settings: {e}")))?;
        fs::write(dir.join(SETTINGS_FILENAME), text)?;
        Ok(())
    }

    /// Reads and validates `settings.json` from a database directory.
    pub fn read(dir: &Path) -> Result<Self> {
        let path = dir.join(SETTINGS_FILENAME);
        let text = fs::read_to_string(&path).map_err(|_| {
            Error::User(format!(
                "'{}' is not a hash database: missing {SETTINGS_FILENAME}",
                dir.display()
            ))
        })?;
        let settings: Settings = serde_json::from_str(&text)
            .map_err(|e| Error::DataIntegrity(format!("corrupt {SETTINGS_FILENAME}: {e}")))?;
        if settings.format_version != FORMAT_VERSION {
            return Err(Error::User(format!(
                "unsupported settings format version {}, expected {FORMAT_VERSION}",
                settings.format_version
            )));
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Refuses a caller-requested geometry that disagrees with the stored one.
    pub fn check_request(
        &self,
        block_size: Option<u32>,
        algorithm: Option<DigestAlgorithm>,
    ) -> Result<()> {
        if let Some(requested) = block_size {
            if requested != self.block_size {
                return Err(Error::User(format!(
                    "requested block size {requested} but database was created with {}",
                    self.block_size
                )));
            }
        }
        if let Some(requested) = algorithm {
            if requested != self.digest_algorithm {
                return Err(Error::User(format!(
                    "requested digest algorithm {} but database was created with {}",
                    requested.name(),
                    self.digest_algorithm.name()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Settings {
        Settings {
            format_version: FORMAT_VERSION,
            block_size: 4096,
            digest_algorithm: DigestAlgorithm::Md5,
            digest_len: 16,
            max_duplicates: 0,
            bloom_enabled: true,
            bloom_k: 3,
            bloom_bits: 1 << 20,
        }
    }

    #[test]
    fn roundtrip_through_directory() {
        let dir = tempfile::tempdir().unwrap();
        let settings = sample();
        settings.write(dir.path()).unwrap();
        let read = Settings::read(dir.path()).unwrap();
        assert_eq!(read, settings);
    }

    #[test]
    fn missing_file_is_a_user_error() {
        let dir = tempfile::tempdir().unwrap();
        match Settings::read(dir.path()) {
            Err(Error::User(_)) => {}
            other => panic!("expected user error, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_block_size_is_refused() {
        let settings = sample();
        assert!(settings.check_request(Some(4096), None).is_ok());
        match settings.check_request(Some(512), None) {
            Err(Error::User(msg)) => assert!(msg.contains("block size")),
            other => panic!("expected user error, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_algorithm_is_refused() {
        let settings = sample();
        assert!(settings
            .check_request(None, Some(DigestAlgorithm::Md5))
            .is_ok());
        assert!(settings
            .check_request(None, Some(DigestAlgorithm::Sha256))
            .is_err());
    }

    #[test]
    fn zero_block_size_fails_validation() {
        let mut settings = sample();
        settings.block_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn digest_lengths() {
        assert_eq!(DigestAlgorithm::Md5.digest_len(), 16);
        assert_eq!(DigestAlgorithm::Sha1.digest_len(), 20);
        assert_eq!(DigestAlgorithm::Sha256.digest_len(), 32);
    }

    #[test]
    fn algorithm_names_parse() {
        assert_eq!(
            DigestAlgorithm::parse("MD5").unwrap(),
            DigestAlgorithm::Md5
        );
        assert_eq!(
            DigestAlgorithm::parse("sha-256").unwrap(),
            DigestAlgorithm::Sha256
        );
        assert!(DigestAlgorithm::parse("crc32").is_err());
    }
}
