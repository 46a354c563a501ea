//! End-to-end import and query scenarios against a real database
//! directory: one source catalogued under two repositories, cap
//! enforcement across imports, and Bloom/store coherence.

use std::path::{Path, PathBuf};

use hashdb_rs::settings::FORMAT_VERSION;
use hashdb_rs::{DigestAlgorithm, HashDb, InsertResult, Settings};

fn settings(max_duplicates: u32) -> Settings {
    Settings {
        format_version: FORMAT_VERSION,
        block_size: 4096,
        digest_algorithm: DigestAlgorithm::Md5,
        digest_len: 16,
        max_duplicates,
        bloom_enabled: true,
        bloom_k: 3,
        bloom_bits: 1 << 16,
    }
}

fn block_hashes(count: usize) -> Vec<[u8; 16]> {
    (0..count)
        .map(|i| {
            let mut h = [0u8; 16];
            h[0] = (i & 0xff) as u8;
            h[1] = ((i >> 8) & 0xff) as u8;
            h[15] = 0x5a;
            h
        })
        .collect()
}

const FILE_HASH: [u8; 16] = [0x77; 16];

/// Imports the same 75-block file under `repository`, the way a reader of
/// file-level record sets drives the import manager.
fn import_file_records(db: &HashDb, repository: &str) -> hashdb_rs::ImportStats {
    let mut manager = db.import_manager().unwrap();
    let (is_new, source_id) = manager
        .insert_source_by_name(repository, "image.raw")
        .unwrap();
    if is_new {
        manager
            .insert_source_name(source_id, repository, "image.raw")
            .unwrap();
        manager
            .insert_source_data(source_id, &FILE_HASH, 75 * 4096, "raw", 0)
            .unwrap();
    }
    for (i, hash) in block_hashes(75).iter().enumerate() {
        manager
            .insert_hash(hash, source_id, (i as u64) * 4096, "", 0, "")
            .unwrap();
    }
    manager.stats()
}

fn create_db(dir: &Path, max_duplicates: u32) -> PathBuf {
    let db_dir = dir.join("db");
    HashDb::create(&db_dir, settings(max_duplicates)).unwrap();
    db_dir
}

#[test]
fn one_import_yields_one_source_and_its_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = create_db(dir.path(), 0);

    let db = HashDb::open_modify(&db_dir).unwrap();
    let stats = import_file_records(&db, "R");
    assert_eq!(stats.hashes_inserted, 75);
    assert_eq!(stats.sources_inserted, 1);

    assert_eq!(db.distinct_hash_count().unwrap(), 75);
    assert_eq!(db.counts().unwrap().source_datas, 1);

    let scan = db.scan_manager().unwrap();
    assert_eq!(scan.find_hash(&block_hashes(1)[0]).unwrap().len(), 1);
}

#[test]
fn same_file_under_second_repository_doubles_occurrences() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = create_db(dir.path(), 0);

    let db = HashDb::open_modify(&db_dir).unwrap();
    import_file_records(&db, "R");
    import_file_records(&db, "R2");

    // Same file hash, two catalogued identities.
    assert_eq!(db.counts().unwrap().source_datas, 2);
    assert_eq!(db.distinct_hash_count().unwrap(), 75);

    let scan = db.scan_manager().unwrap();
    let occurrences = scan.find_hash(&block_hashes(1)[0]).unwrap();
    assert_eq!(occurrences.len(), 2);
    let mut ids: Vec<u64> = occurrences.iter().map(|o| o.source_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);

    // Both sources carry the same file hash.
    assert_eq!(db.source_data(1).unwrap().unwrap().file_hash, FILE_HASH);
    assert_eq!(db.source_data(2).unwrap().unwrap().file_hash, FILE_HASH);
}

#[test]
fn cap_of_one_drops_the_second_import() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = create_db(dir.path(), 1);

    let db = HashDb::open_modify(&db_dir).unwrap();
    let first = import_file_records(&db, "R");
    assert_eq!(first.hashes_inserted, 75);
    assert_eq!(first.hashes_dropped, 0);

    let second = import_file_records(&db, "R2");
    assert_eq!(second.hashes_dropped, 75);
    assert_eq!(second.hashes_inserted, 0);

    let scan = db.scan_manager().unwrap();
    assert_eq!(scan.find_hash(&block_hashes(1)[0]).unwrap().len(), 1);
}

#[test]
fn every_stored_hash_probes_positive_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = create_db(dir.path(), 0);

    {
        let db = HashDb::open_modify(&db_dir).unwrap();
        import_file_records(&db, "R");
    }

    // A fresh read-only handle sees every stored hash through the Bloom
    // filter; a false negative would surface as count 0 here.
    let db = HashDb::open_read(&db_dir).unwrap();
    let scan = db.scan_manager().unwrap();
    for hash in block_hashes(75) {
        assert_eq!(scan.find_hash_count(&hash).unwrap(), 1, "hash {hash:02x?}");
    }
}

#[test]
fn insert_find_roundtrip_with_label() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = create_db(dir.path(), 0);

    let db = HashDb::open_modify(&db_dir).unwrap();
    let mut manager = db.import_manager().unwrap();
    let (_, sid) = manager.insert_source_by_name("R", "F").unwrap();
    manager.insert_source_data(sid, &FILE_HASH, 0, "", 0).unwrap();
    let hash = [0xab; 16];
    assert_eq!(
        manager.insert_hash(&hash, sid, 8192, "W", 0, "").unwrap(),
        InsertResult::Inserted(1)
    );
    drop(manager);

    let scan = db.scan_manager().unwrap();
    let occurrences = scan.find_hash(&hash).unwrap();
    assert_eq!(occurrences.len(), 1);
    assert_eq!(occurrences[0].source_id, sid);
    assert_eq!(occurrences[0].file_offset, 8192);
    assert_eq!(occurrences[0].entropy_label, "W");
}

#[test]
fn expanded_lookup_carries_both_identities() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = create_db(dir.path(), 0);

    let db = HashDb::open_modify(&db_dir).unwrap();
    import_file_records(&db, "R");
    import_file_records(&db, "R2");

    let scan = db.scan_manager().unwrap();
    let record = scan
        .find_expanded_hash(&block_hashes(1)[0], 100)
        .unwrap()
        .unwrap();
    assert_eq!(record.total_count, 2);
    let sources = record.sources.unwrap();
    let mut repos: Vec<&str> = sources.iter().map(|s| s.repository.as_str()).collect();
    repos.sort_unstable();
    assert_eq!(repos, vec!["R", "R2"]);
}
