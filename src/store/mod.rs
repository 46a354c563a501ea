//! The three persistent stores and their shared record types.
//!
//! Keys and values are byte strings built with the [`crate::codec`]
//! primitives. The physical form of the hash table is the duplicates form:
//! every occurrence is its own key/value pair under the block-hash key,
//! which gives constant-time append and a cheap cap check. Tests and callers
//! must not depend on that physical choice beyond the documented cap
//! behavior.

pub mod hash_store;
pub mod source_data_store;
pub mod source_id_store;

use crate::codec;
use crate::error::Result;

/// One observation of a block hash inside a source file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Occurrence {
    /// Dense 64-bit source identifier.
    pub source_id: u64,
    /// Byte offset of the block inside the source. Block-aligned.
    pub file_offset: u64,
    /// Short free-form tag marking low-entropy or whitelisted blocks.
    /// Empty by default.
    pub entropy_label: String,
}

impl Occurrence {
    /// Encodes as `varint(source_id) || varint(offset / block_size) ||
    /// length-prefixed(entropy_label)`.
    pub fn encode(&self, block_size: u32, out: &mut Vec<u8>) {
        codec::encode_u64(self.source_id, out);
        codec::encode_u64(self.file_offset / u64::from(block_size), out);
        codec::encode_bytes(self.entropy_label.as_bytes(), out);
    }

    /// Decodes one occurrence record. The whole input must be consumed;
    /// trailing bytes mean the record is corrupt.
    pub fn decode(input: &[u8], block_size: u32) -> Result<Self> {
        let (source_id, n) = codec::decode_u64(input)?;
        let (block_index, m) = codec::decode_u64(&input[n..])?;
        let (entropy_label, t) = codec::decode_string(&input[n + m..])?;
        if n + m + t != input.len() {
            return Err(crate::error::Error::DataIntegrity(
                "trailing bytes after occurrence record".into(),
            ));
        }
        let file_offset = block_index
            .checked_mul(u64::from(block_size))
            .ok_or_else(|| {
                crate::error::Error::DataIntegrity("occurrence block index overflows".into())
            })?;
        Ok(Self {
            source_id,
            file_offset,
            entropy_label,
        })
    }
}

/// Result of one hash insertion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InsertResult {
    /// Stored; carries the occurrence count after the insert.
    Inserted(u64),
    /// Past the per-hash cap; counted but not stored. Carries the current
    /// stored count.
    Dropped(u64),
    /// The arguments failed validation; nothing was written.
    InvalidArg(InvalidArgKind),
}

/// Validation failures reported by [`InsertResult::InvalidArg`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidArgKind {
    /// `file_offset` is not a multiple of the block size.
    UnalignedOffset,
    /// The hash length does not match the settings digest length.
    BadHashLength,
}
