//! Memory-mapped Bloom filter over block hashes.
//!
//! # Invariants
//! - `bits` is a power of two, at most 2^32, and at least 64.
//! - The k bit positions for a hash are taken from k disjoint little-endian
//!   32-bit windows of the hash bytes themselves; a block hash is already a
//!   uniform random value, so no further mixing is applied. Parameters where
//!   the digest is shorter than `4 * k` bytes are rejected at create time.
//! - False positives are permitted; false negatives are not: a hash is
//!   reported present whenever every probed bit is set.
//!
//! The bit array lives in its own `bloom` file of `bits / 8` bytes inside
//! the database directory and is memory-mapped: read-write while importing
//! or rebuilding, read-only while scanning. A disabled filter passes every
//! probe through so the store is always consulted.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{Mmap, MmapMut};

use crate::error::{Error, Result};
use crate::settings::{Settings, BLOOM_FILENAME};

/// Occupancy ratio used to size the filter from an expected hash count.
///
/// `bits ~= n / 0.17` keeps the false-positive rate in the low percents at
/// k = 3 for up to `n` distinct hashes.
const SIZING_RATIO: f64 = 0.17;

/// Default number of hash functions when sizing from an expected count.
pub const DEFAULT_K: u32 = 3;

/// Smallest permitted bit-array size.
const MIN_BITS: u64 = 64;
/// Largest permitted bit-array size: one 32-bit window must address it.
const MAX_BITS: u64 = 1 << 32;

/// Rejects unusable filter geometry.
pub fn validate_parameters(k: u32, bits: u64, digest_len: usize) -> Result<()> {
    if k == 0 {
        return Err(Error::User("bloom k must be greater than 0".into()));
    }
    if !bits.is_power_of_two() || !(MIN_BITS..=MAX_BITS).contains(&bits) {
        return Err(Error::User(format!(
            "bloom M must be a power of two between {MIN_BITS} and 2^32, got {bits}"
        )));
    }
    if digest_len < 4 * k as usize {
        return Err(Error::User(format!(
            "digest length {digest_len} is too short for k={k}: need at least {} bytes",
            4 * k
        )));
    }
    Ok(())
}

/// Sizes the bit array for an expected number of distinct hashes.
///
/// Rounds `n / 0.17` up to the next power of two so users can size the
/// filter by cardinality instead of geometry.
pub fn bits_for_expected_hashes(n: u64) -> u64 {
    let raw = (n as f64 / SIZING_RATIO).ceil() as u64;
    raw.max(MIN_BITS).next_power_of_two().min(MAX_BITS)
}

/// Expected distinct-hash capacity of a bit-array size, inverse of
/// [`bits_for_expected_hashes`].
pub fn expected_hashes_for_bits(bits: u64) -> u64 {
    (bits as f64 * SIZING_RATIO) as u64
}

enum Backing {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
    Disabled,
}

/// Bit-array negative-lookup accelerator for block hashes.
pub struct BloomFilter {
    backing: Backing,
    k: u32,
    mask: u64,
}

impl BloomFilter {
    /// Creates the `bloom` file of `bits / 8` zero bytes and maps it
    /// read-write. A disabled configuration creates no file.
    pub fn create(dir: &Path, settings: &Settings) -> Result<Self> {
        if !settings.bloom_enabled {
            return Ok(Self::disabled());
        }
        validate_parameters(
            settings.bloom_k,
            settings.bloom_bits,
            settings.digest_len as usize,
        )?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(dir.join(BLOOM_FILENAME))?;
        file.set_len(settings.bloom_bits / 8)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            backing: Backing::ReadWrite(map),
            k: settings.bloom_k,
            mask: settings.bloom_bits - 1,
        })
    }

    /// Maps an existing `bloom` file, read-write when `writable`.
    pub fn open(dir: &Path, settings: &Settings, writable: bool) -> Result<Self> {
        if !settings.bloom_enabled {
            return Ok(Self::disabled());
        }
        validate_parameters(
            settings.bloom_k,
            settings.bloom_bits,
            settings.digest_len as usize,
        )?;
        let path = dir.join(BLOOM_FILENAME);
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(&path)
            .map_err(|e| Error::Io(format!("cannot open {}: {e}", path.display())))?;
        let expected_len = settings.bloom_bits / 8;
        let actual_len = file.metadata()?.len();
        if actual_len != expected_len {
            return Err(Error::DataIntegrity(format!(
                "bloom file is {actual_len} bytes, settings expect {expected_len}"
            )));
        }
        let backing = if writable {
            Backing::ReadWrite(unsafe { MmapMut::map_mut(&file)? })
        } else {
            Backing::ReadOnly(unsafe { Mmap::map(&file)? })
        };
        Ok(Self {
            backing,
            k: settings.bloom_k,
            mask: settings.bloom_bits - 1,
        })
    }

    /// A filter that accepts every probe and ignores every add.
    pub fn disabled() -> Self {
        Self {
            backing: Backing::Disabled,
            k: 0,
            mask: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.backing, Backing::Disabled)
    }

    fn bit_index(&self, hash: &[u8], window: u32) -> u64 {
        let start = 4 * window as usize;
        let word = u32::from_le_bytes([
            hash[start],
            hash[start + 1],
            hash[start + 2],
            hash[start + 3],
        ]);
        u64::from(word) & self.mask
    }

    /// Sets the k bits for `hash`. No-op on read-only and disabled filters.
    pub fn add(&mut self, hash: &[u8]) {
        let k = self.k;
        if let Backing::ReadWrite(map) = &mut self.backing {
            for window in 0..k {
                let start = 4 * window as usize;
                let word = u32::from_le_bytes([
                    hash[start],
                    hash[start + 1],
                    hash[start + 2],
                    hash[start + 3],
                ]);
                let bit = u64::from(word) & self.mask;
                map[(bit / 8) as usize] |= 1 << (bit % 8);
            }
        }
    }

    /// Probes `hash`. False means definitely absent; true means maybe present.
    pub fn probe(&self, hash: &[u8]) -> bool {
        let bytes: &[u8] = match &self.backing {
            Backing::ReadWrite(map) => map,
            Backing::ReadOnly(map) => map,
            Backing::Disabled => return true,
        };
        for window in 0..self.k {
            let bit = self.bit_index(hash, window);
            if bytes[(bit / 8) as usize] & (1 << (bit % 8)) == 0 {
                return false;
            }
        }
        true
    }

    /// Clears every bit. Used by rebuild before re-adding all stored hashes.
    pub fn clear(&mut self) {
        if let Backing::ReadWrite(map) = &mut self.backing {
            map.fill(0);
        }
    }

    /// Flushes dirty pages to the backing file. Advisory.
    pub fn flush(&self) -> Result<()> {
        if let Backing::ReadWrite(map) = &self.backing {
            map.flush()?;
        }
        Ok(())
    }
}

impl Drop for BloomFilter {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::warn!("bloom flush on close failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{DigestAlgorithm, FORMAT_VERSION};

    fn settings(bits: u64, k: u32) -> Settings {
        Settings {
            format_version: FORMAT_VERSION,
            block_size: 512,
            digest_algorithm: DigestAlgorithm::Md5,
            digest_len: 16,
            max_duplicates: 0,
            bloom_enabled: true,
            bloom_k: k,
            bloom_bits: bits,
        }
    }

    fn hash_of(seed: u8) -> Vec<u8> {
        (0..16).map(|i| seed.wrapping_mul(31).wrapping_add(i)).collect()
    }

    #[test]
    fn no_false_negatives() {
        let dir = tempfile::tempdir().unwrap();
        let mut bloom = BloomFilter::create(dir.path(), &settings(1 << 16, 3)).unwrap();
        let hashes: Vec<Vec<u8>> = (0..200).map(|i| hash_of(i as u8)).collect();
        for h in &hashes {
            bloom.add(h);
        }
        for h in &hashes {
            assert!(bloom.probe(h));
        }
    }

    #[test]
    fn empty_filter_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let bloom = BloomFilter::create(dir.path(), &settings(1 << 16, 3)).unwrap();
        assert!(!bloom.probe(&hash_of(42)));
    }

    #[test]
    fn reopen_read_only_sees_added_bits() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(1 << 12, 3);
        {
            let mut bloom = BloomFilter::create(dir.path(), &s).unwrap();
            bloom.add(&hash_of(7));
            bloom.flush().unwrap();
        }
        let bloom = BloomFilter::open(dir.path(), &s, false).unwrap();
        assert!(bloom.probe(&hash_of(7)));
        assert!(!bloom.probe(&hash_of(8)));
    }

    #[test]
    fn short_digest_for_k_is_rejected() {
        // 16-byte digest supports at most k = 4.
        assert!(validate_parameters(4, 1 << 16, 16).is_ok());
        assert!(validate_parameters(5, 1 << 16, 16).is_err());
    }

    #[test]
    fn non_power_of_two_bits_rejected() {
        assert!(validate_parameters(3, 1000, 16).is_err());
        assert!(validate_parameters(3, 1 << 10, 16).is_ok());
    }

    #[test]
    fn sizing_helpers_invert() {
        let bits = bits_for_expected_hashes(1000);
        assert!(bits.is_power_of_two());
        assert!(expected_hashes_for_bits(bits) >= 1000);
        // M ~= n / 0.17 before power-of-two rounding.
        assert!(bits >= (1000f64 / 0.17) as u64);
    }

    #[test]
    fn disabled_filter_passes_probes() {
        let bloom = BloomFilter::disabled();
        assert!(bloom.probe(&hash_of(1)));
        assert!(!bloom.is_enabled());
    }

    #[test]
    fn rebuild_is_bitwise_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(1 << 12, 3);
        let hashes: Vec<Vec<u8>> = (0..50).map(|i| hash_of(i as u8)).collect();

        let mut bloom = BloomFilter::create(dir.path(), &s).unwrap();
        for h in &hashes {
            bloom.add(h);
        }
        bloom.flush().unwrap();
        drop(bloom);
        let first = std::fs::read(dir.path().join(BLOOM_FILENAME)).unwrap();

        let mut bloom = BloomFilter::open(dir.path(), &s, true).unwrap();
        bloom.clear();
        for h in &hashes {
            bloom.add(h);
        }
        bloom.flush().unwrap();
        drop(bloom);
        let second = std::fs::read(dir.path().join(BLOOM_FILENAME)).unwrap();

        assert_eq!(first, second);
    }
}
