//! Block-hash store: multimap of block hash -> occurrence records.
//!
//! # Invariants
//! - Every stored occurrence references a source-id present in the
//!   source-data store (the import manager writes sources first).
//! - When a cap is configured, no hash holds more than `max_duplicates`
//!   occurrences; excess insertions are counted by the caller but never
//!   stored.
//! - Re-inserting an occurrence that is already present leaves the store
//!   unchanged.
//!
//! Lookup order of returned occurrences is unspecified but stable for a
//! given database state.

use redb::ReadableMultimapTable;

use crate::error::Result;
use crate::kv::{StoreEnv, HASH_TABLE};
use crate::store::{InsertResult, Occurrence};

/// Inserts one occurrence under `hash`, enforcing the per-hash cap.
///
/// The count lookup and the append run inside a single write transaction,
/// so the cap holds under the single-writer model. Validation of hash
/// length and offset alignment belongs to the import manager.
pub fn insert(
    env: &StoreEnv,
    block_size: u32,
    max_duplicates: u32,
    hash: &[u8],
    occurrence: &Occurrence,
) -> Result<InsertResult> {
    let mut encoded = Vec::with_capacity(16);
    occurrence.encode(block_size, &mut encoded);

    let txn = env.begin_write()?;
    let result = {
        let mut table = txn.open_multimap_table(HASH_TABLE)?;
        let mut count = 0u64;
        for value in table.get(hash)? {
            value?;
            count += 1;
        }
        if max_duplicates > 0 && count >= u64::from(max_duplicates) {
            InsertResult::Dropped(count)
        } else {
            let already_present = table.insert(hash, encoded.as_slice())?;
            InsertResult::Inserted(if already_present { count } else { count + 1 })
        }
    };
    txn.commit()?;
    if matches!(result, InsertResult::Inserted(_)) {
        env.note_writes(1);
    }
    Ok(result)
}

/// Returns every occurrence stored under `hash`. Empty when absent.
pub fn find(env: &StoreEnv, block_size: u32, hash: &[u8]) -> Result<Vec<Occurrence>> {
    let txn = env.begin_read()?;
    let table = txn.open_multimap_table(HASH_TABLE)?;
    let mut out = Vec::new();
    for value in table.get(hash)? {
        let value = value?;
        out.push(Occurrence::decode(value.value(), block_size)?);
    }
    Ok(out)
}

/// Returns only the occurrence cardinality for `hash`. Used on hot scan
/// paths where decoding every record would be wasted work.
pub fn find_count(env: &StoreEnv, hash: &[u8]) -> Result<u64> {
    let txn = env.begin_read()?;
    let table = txn.open_multimap_table(HASH_TABLE)?;
    let mut count = 0u64;
    for value in table.get(hash)? {
        value?;
        count += 1;
    }
    Ok(count)
}

/// Number of distinct block hashes in the store.
pub fn distinct_hash_count(env: &StoreEnv) -> Result<u64> {
    let txn = env.begin_read()?;
    let table = txn.open_multimap_table(HASH_TABLE)?;
    let mut count = 0u64;
    for entry in table.iter()? {
        entry?;
        count += 1;
    }
    Ok(count)
}

/// Visits every stored hash with its decoded occurrences, in key order.
pub fn for_each<F>(env: &StoreEnv, block_size: u32, mut visit: F) -> Result<()>
where
    F: FnMut(&[u8], &[Occurrence]) -> Result<()>,
{
    let txn = env.begin_read()?;
    let table = txn.open_multimap_table(HASH_TABLE)?;
    let mut occurrences = Vec::new();
    for entry in table.iter()? {
        let (key, values) = entry?;
        occurrences.clear();
        for value in values {
            let value = value?;
            occurrences.push(Occurrence::decode(value.value(), block_size)?);
        }
        visit(key.value(), &occurrences)?;
    }
    Ok(())
}
