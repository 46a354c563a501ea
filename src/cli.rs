//! Command-line front-end.
//!
//! Hand-rolled argv parsing (no argument-parsing dependency): commands are
//! few, options are a closed set, and startup stays instant.
//!
//! # Grammar
//!
//! ```text
//! hashdb-rs <command> <args> [--option value | --option=value]...
//! ```
//!
//! Recognized options: `--hash_block_size`, `--digest_algorithm`,
//! `--max_duplicates`, `--bloom_state`, `--bloom_n`, `--bloom_k_M`,
//! `--repository`, `--step_size`, `--sector_size`,
//! `--process_embedded_data`, `--scan_mode`. Everything else is rejected.
//!
//! Results go to stdout, diagnostics to stderr. Exit codes: 0 on success,
//! 1 on user error, 2 on data-integrity error.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::bloom;
use crate::error::{Error, Result};
use crate::hasher::scan_media::{scan_media, MediaScanConfig, StdoutSink};
use crate::import_tab::{import_tab, DEFAULT_SECTOR_SIZE};
use crate::ops;
use crate::rand_hash::RandomHashes;
use crate::scan::ScanMode;
use crate::server::HashServer;
use crate::settings::{DigestAlgorithm, Settings, FORMAT_VERSION};
use crate::{BloomGeometry, HashDb};

/// Default block size for new databases.
const DEFAULT_BLOCK_SIZE: u32 = 512;
/// Default expected distinct hashes when sizing a fresh Bloom filter.
const DEFAULT_BLOOM_EXPECTED: u64 = 1_000_000;
/// Source budget for expanded output.
const MAX_EXPANDED_SOURCES: u64 = 200;

/// Runs one CLI invocation and returns the process exit code.
pub fn run(args: Vec<String>) -> i32 {
    match dispatch(&args) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{err}");
            err.exit_code()
        }
    }
}

fn dispatch(args: &[String]) -> Result<()> {
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };
    if command == "--help" || command == "-h" || command == "help" {
        print_usage();
        return Ok(());
    }
    let opts = Options::parse(&args[1..])?;

    match command.as_str() {
        "create" => cmd_create(&opts),
        "import_tab" => cmd_import_tab(&opts),
        "export" => cmd_export(&opts),
        "add" => cmd_binary_op(&opts, "add"),
        "intersect" => cmd_ternary_op(&opts, "intersect"),
        "subtract" => cmd_ternary_op(&opts, "subtract"),
        "deduplicate" => cmd_binary_op(&opts, "deduplicate"),
        "scan" => cmd_scan(&opts),
        "scan_hash" => cmd_scan_hash(&opts, false),
        "scan_expanded_hash" => cmd_scan_hash(&opts, true),
        "size" => cmd_size(&opts),
        "sources" => cmd_sources(&opts),
        "histogram" => cmd_histogram(&opts),
        "duplicates" => cmd_duplicates(&opts),
        "rebuild_bloom" => cmd_rebuild_bloom(&opts),
        "server" => cmd_server(&opts),
        "add_random" => cmd_add_random(&opts),
        "scan_random" => cmd_scan_random(&opts),
        other => Err(Error::User(format!(
            "unknown command '{other}'; run with --help for usage"
        ))),
    }
}

/// Parsed options plus positional arguments.
#[derive(Default)]
struct Options {
    positionals: Vec<String>,
    hash_block_size: Option<u32>,
    digest_algorithm: Option<DigestAlgorithm>,
    max_duplicates: Option<u32>,
    bloom_state: Option<bool>,
    bloom_n: Option<u64>,
    bloom_k_m: Option<(u32, u64)>,
    repository: Option<String>,
    step_size: Option<u32>,
    sector_size: Option<u32>,
    process_embedded_data: bool,
    scan_mode: Option<ScanMode>,
}

impl Options {
    fn parse(args: &[String]) -> Result<Self> {
        let mut opts = Options::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let Some(name) = arg.strip_prefix("--") else {
                opts.positionals.push(arg.clone());
                continue;
            };
            let (name, inline_value) = match name.split_once('=') {
                Some((n, v)) => (n, Some(v.to_string())),
                None => (name, None),
            };
            if name == "process_embedded_data" && inline_value.is_none() {
                opts.process_embedded_data = true;
                continue;
            }
            let value = match inline_value {
                Some(v) => v,
                None => iter
                    .next()
                    .ok_or_else(|| Error::User(format!("option --{name} requires a value")))?
                    .clone(),
            };
            match name {
                "hash_block_size" => opts.hash_block_size = Some(parse_number(name, &value)?),
                "digest_algorithm" => {
                    opts.digest_algorithm = Some(DigestAlgorithm::parse(&value)?)
                }
                "max_duplicates" => opts.max_duplicates = Some(parse_number(name, &value)?),
                "bloom_state" => {
                    opts.bloom_state = Some(match value.as_str() {
                        "enabled" => true,
                        "disabled" => false,
                        other => {
                            return Err(Error::User(format!(
                                "bloom_state must be enabled or disabled, got '{other}'"
                            )))
                        }
                    })
                }
                "bloom_n" => opts.bloom_n = Some(parse_number(name, &value)?),
                "bloom_k_M" => {
                    let (k, m) = value.split_once(':').ok_or_else(|| {
                        Error::User(format!("bloom_k_M must look like k:M, got '{value}'"))
                    })?;
                    opts.bloom_k_m =
                        Some((parse_number("bloom_k", k)?, parse_number("bloom_M", m)?));
                }
                "repository" => opts.repository = Some(value),
                "step_size" => opts.step_size = Some(parse_number(name, &value)?),
                "sector_size" => opts.sector_size = Some(parse_number(name, &value)?),
                "process_embedded_data" => {
                    opts.process_embedded_data = match value.as_str() {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(Error::User(format!(
                                "process_embedded_data must be true or false, got '{other}'"
                            )))
                        }
                    }
                }
                "scan_mode" => opts.scan_mode = Some(ScanMode::parse(&value)?),
                other => return Err(Error::User(format!("unknown option '--{other}'"))),
            }
        }
        Ok(opts)
    }

    fn expect_positionals(&self, names: &[&str]) -> Result<Vec<&str>> {
        if self.positionals.len() != names.len() {
            return Err(Error::User(format!(
                "expected arguments: {}",
                names.join(" ")
            )));
        }
        Ok(self.positionals.iter().map(String::as_str).collect())
    }

    fn bloom_geometry(&self, digest_len: usize) -> Result<(bool, u32, u64)> {
        if self.bloom_n.is_some() && self.bloom_k_m.is_some() {
            return Err(Error::User(
                "give either bloom_n or bloom_k_M, not both".into(),
            ));
        }
        let enabled = self.bloom_state.unwrap_or(true);
        let (k, bits) = match self.bloom_k_m {
            Some((k, bits)) => (k, bits),
            None => {
                let n = self.bloom_n.unwrap_or(DEFAULT_BLOOM_EXPECTED);
                (bloom::DEFAULT_K, bloom::bits_for_expected_hashes(n))
            }
        };
        if enabled {
            bloom::validate_parameters(k, bits, digest_len)?;
        }
        Ok((enabled, k, bits))
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::User(format!("invalid value '{value}' for {name}")))
}

fn parse_hash(value: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|_| Error::User(format!("'{value}' is not a hex digest")))
}

fn cmd_create(opts: &Options) -> Result<()> {
    let args = opts.expect_positionals(&["<hashdb_dir>"])?;
    let algorithm = opts.digest_algorithm.unwrap_or(DigestAlgorithm::Md5);
    let (bloom_enabled, bloom_k, bloom_bits) = opts.bloom_geometry(algorithm.digest_len())?;
    let settings = Settings {
        format_version: FORMAT_VERSION,
        block_size: opts.hash_block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
        digest_algorithm: algorithm,
        digest_len: algorithm.digest_len() as u32,
        max_duplicates: opts.max_duplicates.unwrap_or(0),
        bloom_enabled,
        bloom_k,
        bloom_bits,
    };
    HashDb::create(Path::new(args[0]), settings)
}

fn cmd_import_tab(opts: &Options) -> Result<()> {
    let args = opts.expect_positionals(&["<hashdb_dir>", "<tab_file>"])?;
    let db = HashDb::open_modify_checked(
        Path::new(args[0]),
        opts.hash_block_size,
        opts.digest_algorithm,
    )?;
    let tab_path = PathBuf::from(args[1]);
    let tab_filename = tab_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| args[1].to_string());
    let repository = opts.repository.clone().unwrap_or_else(|| tab_filename.clone());

    let file = File::open(&tab_path)
        .map_err(|e| Error::User(format!("cannot open tab file '{}': {e}", tab_path.display())))?;
    let mut manager = db.import_manager()?;
    let stats = import_tab(
        &mut manager,
        &repository,
        &tab_filename,
        opts.sector_size.unwrap_or(DEFAULT_SECTOR_SIZE),
        BufReader::new(file),
    )?;
    for error in &stats.errors {
        eprintln!("{error}");
    }
    println!(
        "# imported {} records, dropped {}, skipped {} bad lines",
        stats.records_imported,
        stats.records_dropped,
        stats.errors.len()
    );
    println!("# {}", manager.stats());
    Ok(())
}

fn cmd_export(opts: &Options) -> Result<()> {
    let args = opts.expect_positionals(&["<hashdb_dir>"])?;
    let db = HashDb::open_read(Path::new(args[0]))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    ops::export(&db, &mut out)
}

fn cmd_binary_op(opts: &Options, which: &str) -> Result<()> {
    let args = opts.expect_positionals(&["<source_db>", "<dest_db>"])?;
    let src = HashDb::open_read(Path::new(args[0]))?;
    let dest = HashDb::open_modify(Path::new(args[1]))?;
    let stats = match which {
        "add" => ops::add(&src, &dest)?,
        _ => ops::deduplicate(&src, &dest)?,
    };
    println!("# {stats}");
    Ok(())
}

fn cmd_ternary_op(opts: &Options, which: &str) -> Result<()> {
    let args = opts.expect_positionals(&["<db_a>", "<db_b>", "<dest_db>"])?;
    let a = HashDb::open_read(Path::new(args[0]))?;
    let b = HashDb::open_read(Path::new(args[1]))?;
    let dest = HashDb::open_modify(Path::new(args[2]))?;
    let stats = match which {
        "intersect" => ops::intersect(&a, &b, &dest)?,
        _ => ops::subtract(&a, &b, &dest)?,
    };
    println!("# {stats}");
    Ok(())
}

fn cmd_scan(opts: &Options) -> Result<()> {
    let args = opts.expect_positionals(&["<hashdb_dir>", "<media_file>"])?;
    let hashdb_dir = Path::new(args[0]);
    let settings = Settings::read(hashdb_dir)?;
    let mut config = MediaScanConfig::new(opts.step_size.unwrap_or(settings.block_size));
    config.scan_mode = opts.scan_mode.unwrap_or(ScanMode::ExpandedOptimized);
    config.process_embedded_data = opts.process_embedded_data;
    config.max_expanded_sources = MAX_EXPANDED_SOURCES;

    let summary = scan_media(hashdb_dir, Path::new(args[1]), &config, Arc::new(StdoutSink))?;
    println!("# Total zero-byte blocks found: {}", summary.zero_count);
    println!(
        "# Scanned {} of {} bytes, {} matches",
        summary.bytes_scanned, summary.media_size, summary.match_count
    );
    Ok(())
}

fn cmd_scan_hash(opts: &Options, expanded: bool) -> Result<()> {
    let args = opts.expect_positionals(&["<hashdb_dir>", "<block_hash_hex>"])?;
    let db = HashDb::open_read(Path::new(args[0]))?;
    let scan = db.scan_manager()?;
    let hash = parse_hash(args[1])?;
    if expanded {
        match scan.find_expanded_hash(&hash, MAX_EXPANDED_SOURCES)? {
            Some(record) => println!("{}", record.to_json()),
            None => println!("{}", serde_json::json!({ "count": 0 })),
        }
    } else {
        let count = scan.find_hash_count(&hash)?;
        println!("{}", serde_json::json!({ "count": count }));
    }
    Ok(())
}

fn cmd_size(opts: &Options) -> Result<()> {
    let args = opts.expect_positionals(&["<hashdb_dir>"])?;
    let db = HashDb::open_read(Path::new(args[0]))?;
    let counts = db.counts()?;
    println!(
        "{}",
        serde_json::json!({
            "hash_records": counts.hash_records,
            "distinct_hashes": db.distinct_hash_count()?,
            "sources": counts.source_datas,
            "source_names": counts.source_names,
        })
    );
    Ok(())
}

fn cmd_sources(opts: &Options) -> Result<()> {
    let args = opts.expect_positionals(&["<hashdb_dir>"])?;
    let db = HashDb::open_read(Path::new(args[0]))?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut failed = None;
    db.for_each_source(|source_id, data| {
        let names = db.source_names(source_id)?;
        let line = serde_json::json!({
            "source_id": source_id,
            "file_hash": hex::encode(&data.file_hash),
            "filesize": data.filesize,
            "file_type": data.file_type,
            "non_probative_count": data.non_probative_count,
            "names": names.iter().map(|(r, f)| serde_json::json!([r, f])).collect::<Vec<_>>(),
        });
        if let Err(e) = writeln!(out, "{line}") {
            failed = Some(Error::Io(format!("write failed: {e}")));
        }
        Ok(())
    })?;
    match failed {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn cmd_histogram(opts: &Options) -> Result<()> {
    let args = opts.expect_positionals(&["<hashdb_dir>"])?;
    let db = HashDb::open_read(Path::new(args[0]))?;
    let mut histogram: BTreeMap<usize, u64> = BTreeMap::new();
    let mut total = 0u64;
    db.for_each_hash(|_, occurrences| {
        *histogram.entry(occurrences.len()).or_insert(0) += 1;
        total += occurrences.len() as u64;
        Ok(())
    })?;
    println!("{}", serde_json::json!({ "total_occurrences": total }));
    for (count, hashes) in histogram {
        println!(
            "{}",
            serde_json::json!({ "occurrences": count, "hashes": hashes })
        );
    }
    Ok(())
}

fn cmd_duplicates(opts: &Options) -> Result<()> {
    let args = opts.expect_positionals(&["<hashdb_dir>", "<occurrence_count>"])?;
    let db = HashDb::open_read(Path::new(args[0]))?;
    let wanted: usize = parse_number("occurrence_count", args[1])?;
    let mut matches = 0u64;
    db.for_each_hash(|hash, occurrences| {
        if occurrences.len() == wanted {
            println!("{}", hex::encode(hash));
            matches += 1;
        }
        Ok(())
    })?;
    println!("# {matches} hashes with {wanted} occurrences");
    Ok(())
}

fn cmd_rebuild_bloom(opts: &Options) -> Result<()> {
    let args = opts.expect_positionals(&["<hashdb_dir>"])?;
    let mut db = HashDb::open_modify(Path::new(args[0]))?;
    let geometry = if opts.bloom_state.is_some()
        || opts.bloom_n.is_some()
        || opts.bloom_k_m.is_some()
    {
        let (enabled, k, bits) = opts.bloom_geometry(db.settings().digest_len as usize)?;
        Some(BloomGeometry { enabled, k, bits })
    } else {
        None
    };
    db.rebuild_bloom(geometry)
}

fn cmd_server(opts: &Options) -> Result<()> {
    let args = opts.expect_positionals(&["<hashdb_dir>", "<port>"])?;
    let port: u16 = parse_number("port", args[1])?;
    let server = HashServer::bind(Path::new(args[0]), &format!("0.0.0.0:{port}"))?;
    server.serve()
}

fn cmd_add_random(opts: &Options) -> Result<()> {
    let args = opts.expect_positionals(&["<hashdb_dir>", "<count>"])?;
    let db = HashDb::open_modify(Path::new(args[0]))?;
    let count: u64 = parse_number("count", args[1])?;
    let block_size = u64::from(db.settings().block_size);
    let digest_len = db.settings().digest_len as usize;
    let repository = opts.repository.clone().unwrap_or_else(|| "random".into());

    let mut manager = db.import_manager()?;
    let mut hashes = RandomHashes::new(1, digest_len);
    let file_hash = hashes.next_hash();
    let (_, source_id) = manager.insert_source_id(&file_hash)?;
    manager.insert_source_name(source_id, &repository, "add_random")?;
    manager.insert_source_data(source_id, &file_hash, 0, "", 0)?;
    for i in 0..count {
        manager.insert_hash(&hashes.next_hash(), source_id, i * block_size, "", 0, "")?;
    }
    println!("# {}", manager.stats());
    Ok(())
}

fn cmd_scan_random(opts: &Options) -> Result<()> {
    let args = opts.expect_positionals(&["<hashdb_dir>", "<count>"])?;
    let db = HashDb::open_read(Path::new(args[0]))?;
    let count: u64 = parse_number("count", args[1])?;
    let scan = db.scan_manager()?;
    let mut hashes = RandomHashes::new(2, db.settings().digest_len as usize);
    let mut found = 0u64;
    for _ in 0..count {
        let hash = hashes.next_hash();
        let matches = scan.find_hash_count(&hash)?;
        if matches > 0 {
            println!("{}\t{}", hex::encode(&hash), matches);
            found += 1;
        }
    }
    println!("# {found} of {count} random hashes matched");
    Ok(())
}

fn print_usage() {
    eprintln!(
        "usage: hashdb-rs <command> [args] [options]

commands:
  create <hashdb_dir>                     create a new hash database
  import_tab <hashdb_dir> <tab_file>      import tab-delimited records
  export <hashdb_dir>                     write the database as JSON lines
  add <source_db> <dest_db>               copy all hashes into dest
  intersect <db_a> <db_b> <dest_db>       copy hashes common to both
  subtract <db_a> <db_b> <dest_db>        copy hashes of A absent from B
  deduplicate <source_db> <dest_db>       copy single-occurrence hashes
  scan <hashdb_dir> <media_file>          scan media for known blocks
  scan_hash <hashdb_dir> <hex>            count occurrences of one hash
  scan_expanded_hash <hashdb_dir> <hex>   expand one hash to its sources
  size <hashdb_dir>                       table entry counts
  sources <hashdb_dir>                    list sources
  histogram <hashdb_dir>                  occurrence-count histogram
  duplicates <hashdb_dir> <count>         hashes with exactly <count> uses
  rebuild_bloom <hashdb_dir>              regenerate the Bloom filter
  server <hashdb_dir> <port>              serve hash-count queries
  add_random <hashdb_dir> <count>         import pseudo-random hashes
  scan_random <hashdb_dir> <count>        probe pseudo-random hashes

options:
  --hash_block_size <bytes>   --digest_algorithm <md5|sha1|sha256>
  --max_duplicates <n>        --bloom_state <enabled|disabled>
  --bloom_n <n>               --bloom_k_M <k:M>
  --repository <name>         --step_size <bytes>
  --sector_size <bytes>       --process_embedded_data
  --scan_mode <count_only|expanded|expanded_optimized>"
    );
}
