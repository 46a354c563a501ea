//! Source-data store: source-id -> file-level metadata record.
//!
//! The record layout is `file_hash[digest_len] || varint(filesize) ||
//! varint(type_len) type || varint(non_probative_count)`. The file hash is
//! raw bytes of the settings digest length, not length-prefixed. Updates are
//! last-write-wins; callers are expected to write once per source-id, on
//! first observation. Sentinel zeros (`filesize = 0`, empty type, zero
//! non-probative count) mean "unknown", not literal zero.

use redb::ReadableTable;

use crate::codec;
use crate::error::{Error, Result};
use crate::kv::{StoreEnv, SOURCE_DATA_TABLE};

/// File-level metadata carried by a source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceData {
    /// Digest of the whole source file.
    pub file_hash: Vec<u8>,
    /// Source file size in bytes. 0 means unknown.
    pub filesize: u64,
    /// Free-form file-type string. Empty means unknown.
    pub file_type: String,
    /// Count of non-probative blocks in the source. 0 means unknown.
    pub non_probative_count: u64,
}

impl SourceData {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.file_hash);
        codec::encode_u64(self.filesize, out);
        codec::encode_bytes(self.file_type.as_bytes(), out);
        codec::encode_u64(self.non_probative_count, out);
    }

    pub fn decode(input: &[u8], digest_len: usize) -> Result<Self> {
        if input.len() < digest_len {
            return Err(Error::DataIntegrity(
                "source-data record shorter than digest length".into(),
            ));
        }
        let file_hash = input[..digest_len].to_vec();
        let rest = &input[digest_len..];
        let (filesize, n) = codec::decode_u64(rest)?;
        let (file_type, m) = codec::decode_string(&rest[n..])?;
        let (non_probative_count, t) = codec::decode_u64(&rest[n + m..])?;
        if digest_len + n + m + t != input.len() {
            return Err(Error::DataIntegrity(
                "trailing bytes after source-data record".into(),
            ));
        }
        Ok(Self {
            file_hash,
            filesize,
            file_type,
            non_probative_count,
        })
    }
}

/// Writes the record for `source_id`. Returns true when the id was new.
pub fn insert(env: &StoreEnv, source_id: u64, data: &SourceData) -> Result<bool> {
    let mut encoded = Vec::with_capacity(data.file_hash.len() + data.file_type.len() + 8);
    data.encode(&mut encoded);
    let txn = env.begin_write()?;
    let is_new = {
        let mut table = txn.open_table(SOURCE_DATA_TABLE)?;
        let prev = table.insert(source_id, encoded.as_slice())?;
        prev.is_none()
    };
    txn.commit()?;
    if is_new {
        env.note_writes(1);
    }
    Ok(is_new)
}

/// Reads the record for `source_id`.
pub fn find(env: &StoreEnv, digest_len: usize, source_id: u64) -> Result<Option<SourceData>> {
    let txn = env.begin_read()?;
    let table = txn.open_table(SOURCE_DATA_TABLE)?;
    match table.get(source_id)? {
        Some(value) => Ok(Some(SourceData::decode(value.value(), digest_len)?)),
        None => Ok(None),
    }
}

/// Visits every (source_id, record), in id order.
pub fn for_each<F>(env: &StoreEnv, digest_len: usize, mut visit: F) -> Result<()>
where
    F: FnMut(u64, &SourceData) -> Result<()>,
{
    let txn = env.begin_read()?;
    let table = txn.open_table(SOURCE_DATA_TABLE)?;
    for entry in table.iter()? {
        let (id, value) = entry?;
        let data = SourceData::decode(value.value(), digest_len)?;
        visit(id.value(), &data)?;
    }
    Ok(())
}
