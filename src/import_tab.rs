//! Tab-delimited import reader.
//!
//! One record per line: `<file_hash_hex>\t<block_hash_hex>\t<sector_index>`.
//! Sector indexes are 1-based, so the imported offset is
//! `(sector_index - 1) * sector_size`. Lines starting with `#` and empty
//! lines are skipped. A malformed line is reported with its 1-based line
//! number and skipped; it never aborts the import.
//!
//! Sources seen here carry no file-level metadata, so the source-data
//! record is written with sentinel zeros, meaning "unknown".

use std::io::BufRead;

use crate::error::{Error, Result};
use crate::import::ImportManager;
use crate::store::{InsertResult, InvalidArgKind};

/// Default sector size for tab imports.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Outcome of one tab import.
#[derive(Clone, Debug, Default)]
pub struct TabImportStats {
    /// Lines read, including comments and blanks.
    pub lines: u64,
    /// Records that stored an occurrence.
    pub records_imported: u64,
    /// Records dropped by the per-hash cap.
    pub records_dropped: u64,
    /// Malformed lines, one message each, with 1-based line numbers.
    pub errors: Vec<String>,
}

/// Reads tab records from `input` into the database.
///
/// `tab_filename` is recorded as the filename of every new source;
/// `repository` names where the record set came from.
pub fn import_tab<R: BufRead>(
    manager: &mut ImportManager,
    repository: &str,
    tab_filename: &str,
    sector_size: u32,
    input: R,
) -> Result<TabImportStats> {
    if sector_size == 0 {
        return Err(Error::User("sector_size must be greater than 0".into()));
    }
    let mut stats = TabImportStats::default();

    for line in input.lines() {
        let line = line.map_err(|e| Error::Io(format!("read failed on tab input: {e}")))?;
        stats.lines += 1;
        let line_number = stats.lines;
        let line = line.trim_end_matches('\r');

        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Err(message) = import_line(manager, repository, tab_filename, sector_size, line, &mut stats)
        {
            stats
                .errors
                .push(format!("{message} on line {line_number}: '{line}'"));
        }
    }

    tracing::info!(
        "tab import done: {} records, {} dropped, {} bad lines",
        stats.records_imported,
        stats.records_dropped,
        stats.errors.len()
    );
    Ok(stats)
}

/// Imports one record line. Returns a description of what is wrong with
/// the line, for the error report.
fn import_line(
    manager: &mut ImportManager,
    repository: &str,
    tab_filename: &str,
    sector_size: u32,
    line: &str,
    stats: &mut TabImportStats,
) -> std::result::Result<(), String> {
    let mut fields = line.split('\t');
    let file_hash_hex = fields.next().ok_or("missing file hash")?;
    let block_hash_hex = fields.next().ok_or("tab not found")?;
    let sector_field = fields.next().ok_or("second tab not found")?;

    let file_hash = hex::decode(file_hash_hex).map_err(|_| "invalid file hash hexdigest")?;
    let block_hash = hex::decode(block_hash_hex).map_err(|_| "invalid block hash hexdigest")?;
    let digest_len = manager.settings().digest_len as usize;
    if file_hash.len() != digest_len {
        return Err("wrong file hash length".into());
    }
    if block_hash.len() != digest_len {
        return Err("wrong block hash length".into());
    }

    let sector_index: u64 = sector_field
        .trim()
        .parse()
        .map_err(|_| "invalid sector index")?;
    if sector_index == 0 {
        // Indexes are 1-based; 0 cannot name a sector.
        return Err("invalid sector index".into());
    }
    let file_offset = (sector_index - 1)
        .checked_mul(u64::from(sector_size))
        .ok_or("sector index out of range")?;

    let (is_new, source_id) = manager
        .insert_source_id(&file_hash)
        .map_err(|e| e.to_string())?;
    if is_new {
        manager
            .insert_source_name(source_id, repository, tab_filename)
            .map_err(|e| e.to_string())?;
        manager
            .insert_source_data(source_id, &file_hash, 0, "", 0)
            .map_err(|e| e.to_string())?;
    }

    match manager
        .insert_hash(&block_hash, source_id, file_offset, "", 0, "")
        .map_err(|e| e.to_string())?
    {
        InsertResult::Inserted(_) => {
            stats.records_imported += 1;
            Ok(())
        }
        InsertResult::Dropped(_) => {
            stats.records_dropped += 1;
            Ok(())
        }
        InsertResult::InvalidArg(InvalidArgKind::UnalignedOffset) => {
            Err("sector offset is not block-aligned".into())
        }
        InsertResult::InvalidArg(InvalidArgKind::BadHashLength) => {
            Err("wrong block hash length".into())
        }
    }
}
