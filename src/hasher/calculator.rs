//! Fixed-algorithm block digest calculator.
//!
//! The algorithm is chosen at database create time and frozen in settings;
//! the calculator dispatches on it at runtime and otherwise treats digests
//! as plain byte strings of the configured length.
//!
//! The digest of the all-zeroes block is precomputed once so the zero-block
//! fast path is a byte comparison, not a hash. Zero blocks are scanned but
//! never reported as matches; they swamp reports and are almost always
//! meaningless.

use digest::Digest;
use md5::Md5;
use sha1::Sha1;
use sha2::Sha256;

use crate::settings::DigestAlgorithm;

/// Digest calculator for one database geometry.
pub struct HashCalculator {
    algorithm: DigestAlgorithm,
    block_size: u32,
    zero_digest: Vec<u8>,
}

impl HashCalculator {
    pub fn new(algorithm: DigestAlgorithm, block_size: u32) -> Self {
        let zeroes = vec![0u8; block_size as usize];
        let zero_digest = digest_with(algorithm, &zeroes);
        Self {
            algorithm,
            block_size,
            zero_digest,
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Digest of a full block.
    pub fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        if bytes.len() == self.block_size as usize && super::is_all_zeros(bytes) {
            return self.zero_digest.clone();
        }
        digest_with(self.algorithm, bytes)
    }

    /// Digest of a trailing partial block, zero-padded to the block size.
    /// Only used when the orchestrator explicitly asks for padding; by
    /// default a trailing partial block is not hashed.
    pub fn digest_zero_padded(&self, bytes: &[u8]) -> Vec<u8> {
        if bytes.len() >= self.block_size as usize {
            return self.digest(&bytes[..self.block_size as usize]);
        }
        let mut padded = vec![0u8; self.block_size as usize];
        padded[..bytes.len()].copy_from_slice(bytes);
        self.digest(&padded)
    }

    /// Precomputed digest of the all-zeroes block.
    pub fn zero_digest(&self) -> &[u8] {
        &self.zero_digest
    }
}

fn digest_with(algorithm: DigestAlgorithm, bytes: &[u8]) -> Vec<u8> {
    match algorithm {
        DigestAlgorithm::Md5 => Md5::digest(bytes).to_vec(),
        DigestAlgorithm::Sha1 => Sha1::digest(bytes).to_vec(),
        DigestAlgorithm::Sha256 => Sha256::digest(bytes).to_vec(),
    }
}
