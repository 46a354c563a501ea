//! Source-id store: (repository, filename) -> dense source-id, plus the
//! inverse name-enumeration table.
//!
//! New ids come from a monotonic allocator persisted in the meta table, so
//! density does not depend on how many names a source accumulates: after N
//! distinct assignments the observed ids are exactly 1..=N. Single-writer
//! semantics make the read-increment-write race-free.

use redb::{ReadableMultimapTable, ReadableTable};

use crate::codec;
use crate::error::Result;
use crate::kv::{StoreEnv, META_LAST_SOURCE_ID, META_TABLE, SOURCE_ID_TABLE, SOURCE_NAME_TABLE};

/// Composite key: length-prefixed repository, then length-prefixed filename.
pub fn name_key(repository: &str, filename: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(repository.len() + filename.len() + 4);
    codec::encode_bytes(repository.as_bytes(), &mut key);
    codec::encode_bytes(filename.as_bytes(), &mut key);
    key
}

/// Decodes a composite name key back into (repository, filename).
pub fn decode_name_key(key: &[u8]) -> Result<(String, String)> {
    let (repository, n) = codec::decode_string(key)?;
    let (filename, _) = codec::decode_string(&key[n..])?;
    Ok((repository, filename))
}

/// Returns the existing id for the name, or assigns the next dense id.
///
/// The returned flag is true when the id was newly assigned.
pub fn insert_or_get(env: &StoreEnv, repository: &str, filename: &str) -> Result<(bool, u64)> {
    let key = name_key(repository, filename);
    let txn = env.begin_write()?;
    let (is_new, source_id) = {
        let mut ids = txn.open_table(SOURCE_ID_TABLE)?;
        let existing = ids.get(key.as_slice())?.map(|v| v.value());
        match existing {
            Some(id) => (false, id),
            None => {
                let mut meta = txn.open_table(META_TABLE)?;
                let last = meta
                    .get(META_LAST_SOURCE_ID)?
                    .map(|v| v.value())
                    .unwrap_or(0);
                let assigned = last + 1;
                meta.insert(META_LAST_SOURCE_ID, assigned)?;
                ids.insert(key.as_slice(), assigned)?;
                (true, assigned)
            }
        }
    };
    txn.commit()?;
    if is_new {
        env.note_writes(1);
    }
    Ok((is_new, source_id))
}

/// Looks up the id for a name without assigning one.
pub fn find(env: &StoreEnv, repository: &str, filename: &str) -> Result<Option<u64>> {
    let key = name_key(repository, filename);
    let txn = env.begin_read()?;
    let ids = txn.open_table(SOURCE_ID_TABLE)?;
    Ok(ids.get(key.as_slice())?.map(|v| v.value()))
}

/// Records `(repository, filename)` as a name of `source_id`.
///
/// Writes the enumeration pair and, when the name is not yet mapped, the
/// forward entry as well, so "(repository, filename) -> exactly one
/// source-id" keeps holding. An existing mapping is never overwritten.
/// Returns true when the enumeration pair was new.
pub fn insert_name(
    env: &StoreEnv,
    source_id: u64,
    repository: &str,
    filename: &str,
) -> Result<bool> {
    let key = name_key(repository, filename);
    let txn = env.begin_write()?;
    let is_new = {
        let mut ids = txn.open_table(SOURCE_ID_TABLE)?;
        if ids.get(key.as_slice())?.is_none() {
            ids.insert(key.as_slice(), source_id)?;
        }
        let mut names = txn.open_multimap_table(SOURCE_NAME_TABLE)?;
        !names.insert(source_id, key.as_slice())?
    };
    txn.commit()?;
    if is_new {
        env.note_writes(1);
    }
    Ok(is_new)
}

/// Every (repository, filename) recorded for `source_id`.
pub fn names_of(env: &StoreEnv, source_id: u64) -> Result<Vec<(String, String)>> {
    let txn = env.begin_read()?;
    let names = txn.open_multimap_table(SOURCE_NAME_TABLE)?;
    let mut out = Vec::new();
    for value in names.get(source_id)? {
        let value = value?;
        out.push(decode_name_key(value.value())?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let env = StoreEnv::create(dir.path()).unwrap();

        let mut observed = Vec::new();
        for i in 0..10 {
            let (is_new, id) = insert_or_get(&env, "repo", &format!("file-{i}")).unwrap();
            assert!(is_new);
            observed.push(id);
        }
        assert_eq!(observed, (1..=10).collect::<Vec<u64>>());
    }

    #[test]
    fn existing_name_returns_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let env = StoreEnv::create(dir.path()).unwrap();

        let (is_new, first) = insert_or_get(&env, "r", "f").unwrap();
        assert!(is_new);
        let (is_new, again) = insert_or_get(&env, "r", "f").unwrap();
        assert!(!is_new);
        assert_eq!(first, again);
        assert_eq!(find(&env, "r", "f").unwrap(), Some(first));
        assert_eq!(find(&env, "r", "other").unwrap(), None);
    }

    #[test]
    fn same_filename_in_two_repositories_gets_two_ids() {
        let dir = tempfile::tempdir().unwrap();
        let env = StoreEnv::create(dir.path()).unwrap();

        let (_, a) = insert_or_get(&env, "R", "F").unwrap();
        let (_, b) = insert_or_get(&env, "R2", "F").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn extra_names_do_not_disturb_density() {
        let dir = tempfile::tempdir().unwrap();
        let env = StoreEnv::create(dir.path()).unwrap();

        let (_, first) = insert_or_get(&env, "r", "f1").unwrap();
        assert!(insert_name(&env, first, "mirror", "f1").unwrap());
        // The extra forward entry must not advance the allocator.
        let (is_new, second) = insert_or_get(&env, "r", "f2").unwrap();
        assert!(is_new);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn names_enumerate_in_insert_agnostic_order() {
        let dir = tempfile::tempdir().unwrap();
        let env = StoreEnv::create(dir.path()).unwrap();

        let (_, id) = insert_or_get(&env, "repoA", "file").unwrap();
        insert_name(&env, id, "repoA", "file").unwrap();
        insert_name(&env, id, "repoB", "file").unwrap();
        // Re-adding the same pair is a no-op.
        assert!(!insert_name(&env, id, "repoB", "file").unwrap());

        let mut names = names_of(&env, id).unwrap();
        names.sort();
        assert_eq!(
            names,
            vec![
                ("repoA".to_string(), "file".to_string()),
                ("repoB".to_string(), "file".to_string())
            ]
        );
    }

    #[test]
    fn name_key_roundtrip() {
        let key = name_key("repo with spaces", "file\twith\ttabs");
        let (repo, file) = decode_name_key(&key).unwrap();
        assert_eq!(repo, "repo with spaces");
        assert_eq!(file, "file\twith\ttabs");
    }
}
