//! Whole-database operations: add, intersect, subtract, deduplicate, and
//! export.
//!
//! Source-ids are database-local, so copying an occurrence means
//! re-identifying its source in the destination: the source's names are
//! replayed through the destination's import manager, which assigns (or
//! finds) a destination id, and data plus remaining names follow. A memo
//! keeps each source resolved once per operation, so invariant "every
//! occurrence references an existing source" holds in the output.
//!
//! The databases involved must agree on block size and digest algorithm;
//! anything else is a user error before any write happens.

use std::collections::HashMap;
use std::io::Write;

use crate::error::{Error, Result};
use crate::import::{ImportManager, ImportStats, FILE_HASH_REPOSITORY};
use crate::store::Occurrence;
use crate::HashDb;

/// Ensures the two databases share a geometry before copying between them.
fn check_compatible(a: &HashDb, b: &HashDb) -> Result<()> {
    let (sa, sb) = (a.settings(), b.settings());
    if sa.block_size != sb.block_size {
        return Err(Error::User(format!(
            "block size mismatch: {} vs {}",
            sa.block_size, sb.block_size
        )));
    }
    if sa.digest_algorithm != sb.digest_algorithm {
        return Err(Error::User(format!(
            "digest algorithm mismatch: {} vs {}",
            sa.digest_algorithm.name(),
            sb.digest_algorithm.name()
        )));
    }
    Ok(())
}

/// Maps source-ids of one input database onto destination ids, copying
/// source data and names on first use.
struct SourceCopier<'a> {
    src: &'a HashDb,
    memo: HashMap<u64, u64>,
}

impl<'a> SourceCopier<'a> {
    fn new(src: &'a HashDb) -> Self {
        Self {
            src,
            memo: HashMap::new(),
        }
    }

    fn resolve(&mut self, dest: &mut ImportManager, src_id: u64) -> Result<u64> {
        if let Some(&dest_id) = self.memo.get(&src_id) {
            return Ok(dest_id);
        }
        let data = self.src.source_data(src_id)?.ok_or_else(|| {
            Error::DataIntegrity(format!(
                "occurrence references source-id {src_id} with no source data"
            ))
        })?;
        let mut names = self.src.source_names(src_id)?;
        names.sort();

        // Identify the source in the destination by its first name, or by
        // its file hash when it has no names at all.
        let dest_id = match names.first() {
            Some((repository, filename)) if repository != FILE_HASH_REPOSITORY => {
                dest.insert_source_by_name(repository, filename)?.1
            }
            _ => dest.insert_source_id(&data.file_hash)?.1,
        };
        for (repository, filename) in &names {
            dest.insert_source_name(dest_id, repository, filename)?;
        }
        dest.insert_source_data(
            dest_id,
            &data.file_hash,
            data.filesize,
            &data.file_type,
            data.non_probative_count,
        )?;
        self.memo.insert(src_id, dest_id);
        Ok(dest_id)
    }

    fn copy_occurrences(
        &mut self,
        dest: &mut ImportManager,
        hash: &[u8],
        occurrences: &[Occurrence],
    ) -> Result<()> {
        for occurrence in occurrences {
            let dest_id = self.resolve(dest, occurrence.source_id)?;
            dest.insert_hash(
                hash,
                dest_id,
                occurrence.file_offset,
                &occurrence.entropy_label,
                0,
                "",
            )?;
        }
        Ok(())
    }
}

/// Copies every hash and source of `src` into `dest`.
pub fn add(src: &HashDb, dest: &HashDb) -> Result<ImportStats> {
    check_compatible(src, dest)?;
    let mut manager = dest.import_manager()?;
    let mut copier = SourceCopier::new(src);
    src.for_each_hash(|hash, occurrences| copier.copy_occurrences(&mut manager, hash, occurrences))?;
    Ok(manager.stats())
}

/// Copies hashes present in both `a` and `b` into `dest`, with the
/// occurrences of both.
pub fn intersect(a: &HashDb, b: &HashDb, dest: &HashDb) -> Result<ImportStats> {
    check_compatible(a, b)?;
    check_compatible(a, dest)?;
    let b_scan = b.scan_manager()?;
    let mut manager = dest.import_manager()?;
    let mut from_a = SourceCopier::new(a);
    a.for_each_hash(|hash, occurrences| {
        if b_scan.find_hash_count(hash)? > 0 {
            from_a.copy_occurrences(&mut manager, hash, occurrences)?;
        }
        Ok(())
    })?;
    let a_scan = a.scan_manager()?;
    let mut from_b = SourceCopier::new(b);
    b.for_each_hash(|hash, occurrences| {
        if a_scan.find_hash_count(hash)? > 0 {
            from_b.copy_occurrences(&mut manager, hash, occurrences)?;
        }
        Ok(())
    })?;
    Ok(manager.stats())
}

/// Copies hashes of `a` that are absent from `b` into `dest`.
pub fn subtract(a: &HashDb, b: &HashDb, dest: &HashDb) -> Result<ImportStats> {
    check_compatible(a, b)?;
    check_compatible(a, dest)?;
    let b_scan = b.scan_manager()?;
    let mut manager = dest.import_manager()?;
    let mut copier = SourceCopier::new(a);
    a.for_each_hash(|hash, occurrences| {
        if b_scan.find_hash_count(hash)? == 0 {
            copier.copy_occurrences(&mut manager, hash, occurrences)?;
        }
        Ok(())
    })?;
    Ok(manager.stats())
}

/// Copies hashes of `src` with exactly one occurrence into `dest`.
pub fn deduplicate(src: &HashDb, dest: &HashDb) -> Result<ImportStats> {
    check_compatible(src, dest)?;
    let mut manager = dest.import_manager()?;
    let mut copier = SourceCopier::new(src);
    src.for_each_hash(|hash, occurrences| {
        if occurrences.len() == 1 {
            copier.copy_occurrences(&mut manager, hash, occurrences)?;
        }
        Ok(())
    })?;
    Ok(manager.stats())
}

/// Writes the database as line-delimited JSON: one object per source,
/// then one per block hash.
pub fn export<W: Write>(db: &HashDb, out: &mut W) -> Result<()> {
    let mut write_line = |value: serde_json::Value| -> Result<()> {
        writeln!(out, "{value}").map_err(|e| Error::Io(format!("export write failed: {e}")))
    };

    let mut sources: Vec<serde_json::Value> = Vec::new();
    db.for_each_source(|source_id, data| {
        let names = db.source_names(source_id)?;
        let name_pairs: Vec<serde_json::Value> = names
            .iter()
            .map(|(r, f)| serde_json::json!([r, f]))
            .collect();
        sources.push(serde_json::json!({
            "source_id": source_id,
            "file_hash": hex::encode(&data.file_hash),
            "filesize": data.filesize,
            "file_type": data.file_type,
            "non_probative_count": data.non_probative_count,
            "names": name_pairs,
        }));
        Ok(())
    })?;
    for source in sources {
        write_line(source)?;
    }

    let mut hashes: Vec<serde_json::Value> = Vec::new();
    db.for_each_hash(|hash, occurrences| {
        let entries: Vec<serde_json::Value> = occurrences
            .iter()
            .map(|o| serde_json::json!([o.source_id, o.file_offset, o.entropy_label]))
            .collect();
        hashes.push(serde_json::json!({
            "block_hash": hex::encode(hash),
            "occurrences": entries,
        }));
        Ok(())
    })?;
    for hash in hashes {
        write_line(hash)?;
    }
    Ok(())
}
