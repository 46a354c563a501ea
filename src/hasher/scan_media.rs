//! Media scan orchestrator.
//!
//! # Architecture
//!
//! ```text
//!  FileReader ── 17 MiB buffers ──> JobQueue ──> WorkerPool
//!                                                 │ per step offset:
//!                                                 │   zero check -> digest -> ScanManager
//!                                                 │ embedded streams -> derived jobs
//!                                                 └──> MatchSink
//! ```
//!
//! The media is read in [`BUFFER_SIZE`] chunks whose first
//! [`BUFFER_DATA_SIZE`] bytes are the chunk's own data; the trailing 1 MiB
//! is overlap so a window starting on the last data byte still completes
//! within the same buffer. Successive chunks start `BUFFER_DATA_SIZE`
//! apart. Workers compute a digest at every step-multiple offset in the
//! data region whose full block lies inside the buffer and probe the scan
//! manager for matches.
//!
//! Output order follows worker completion order, not file order;
//! downstream consumers that need sorted output must sort.
//!
//! # Failure policy
//!
//! A media read error aborts the current file, not the pool. A hash lookup
//! error is fatal: the first one is recorded, the pipeline drains, and the
//! scan returns it. Worker panics are caught per job, logged, and do not
//! poison the queue.

use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::hasher::embedded::find_embedded_streams;
use crate::hasher::{is_all_zeros, FileReader, HashCalculator, JobQueue, ScanJob, ScanTracker, WorkerPool};
use crate::kv::{FileMode, StoreEnv};
use crate::scan::{ScanManager, ScanMode};
use crate::settings::Settings;

/// Own-data bytes per buffer: 16 MiB.
pub const BUFFER_DATA_SIZE: usize = 16 * 1024 * 1024;
/// Full buffer size: data region plus 1 MiB of overlap.
pub const BUFFER_SIZE: usize = BUFFER_DATA_SIZE + 1024 * 1024;
/// Derived jobs deeper than this are rejected.
pub const MAX_RECURSION_DEPTH: usize = 7;

/// Embedded streams expanded per buffer.
const MAX_EMBEDDED_STREAMS_PER_BUFFER: usize = 64;
/// Inflated bytes per embedded stream.
const MAX_EMBEDDED_STREAM_BYTES: usize = BUFFER_SIZE;

/// Default source budget for expanded match records.
pub const DEFAULT_MAX_EXPANDED_SOURCES: u64 = 200;

/// Tunables for one media scan.
#[derive(Clone, Debug)]
pub struct MediaScanConfig {
    /// Distance between successive window starts. At most the block size.
    pub step_size: u32,
    /// Detail level per matched block.
    pub scan_mode: ScanMode,
    /// Expand recognized embedded containers into derived scan jobs.
    pub process_embedded_data: bool,
    /// Worker thread count; 0 means one per CPU.
    pub workers: usize,
    /// Source budget for expanded records.
    pub max_expanded_sources: u64,
}

impl MediaScanConfig {
    pub fn new(step_size: u32) -> Self {
        Self {
            step_size,
            scan_mode: ScanMode::CountOnly,
            process_embedded_data: false,
            workers: 0,
            max_expanded_sources: DEFAULT_MAX_EXPANDED_SOURCES,
        }
    }

    fn validate(&self, settings: &Settings) -> Result<()> {
        if self.step_size == 0 {
            return Err(Error::User("step_size must be greater than 0".into()));
        }
        if self.step_size > settings.block_size {
            return Err(Error::User(format!(
                "step_size {} exceeds block size {}",
                self.step_size, settings.block_size
            )));
        }
        Ok(())
    }

    fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            num_cpus::get().max(1)
        }
    }
}

/// One reported match.
#[derive(Clone, Debug)]
pub struct MatchRecord {
    /// Where the block was found: an absolute media offset, prefixed with
    /// the recursion path for matches inside embedded streams.
    pub coordinate: String,
    /// The matched block hash.
    pub block_hash: Vec<u8>,
    /// Mode-dependent detail: a count object or a full expansion.
    pub payload: serde_json::Value,
}

/// Receives match records from scan workers. Implementations synchronize
/// internally; workers call from many threads.
pub trait MatchSink: Send + Sync {
    fn record(&self, record: &MatchRecord);
}

/// Writes tab-separated match lines to stdout:
/// `coordinate<TAB>hash_hex<TAB>json`.
pub struct StdoutSink;

impl MatchSink for StdoutSink {
    fn record(&self, record: &MatchRecord) {
        let mut stdout = std::io::stdout().lock();
        if writeln!(
            stdout,
            "{}\t{}\t{}",
            record.coordinate,
            hex::encode(&record.block_hash),
            record.payload
        )
        .is_err()
        {
            tracing::warn!("dropping match record: stdout write failed");
        }
    }
}

/// Collects match records in memory. Test and library consumer sink.
#[derive(Default)]
pub struct VecSink {
    records: Mutex<Vec<MatchRecord>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<MatchRecord> {
        std::mem::take(&mut *self.records.lock().expect("sink mutex poisoned"))
    }
}

impl MatchSink for VecSink {
    fn record(&self, record: &MatchRecord) {
        self.records
            .lock()
            .expect("sink mutex poisoned")
            .push(record.clone());
    }
}

/// Aggregate results of one media scan.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanSummary {
    pub media_size: u64,
    pub bytes_scanned: u64,
    pub zero_count: u64,
    pub match_count: u64,
}

struct WorkerContext {
    queue: Arc<JobQueue<ScanJob>>,
    scan_manager: ScanManager,
    calculator: HashCalculator,
    tracker: ScanTracker,
    sink: Arc<dyn MatchSink>,
    config: MediaScanConfig,
    failure: Mutex<Option<Error>>,
}

impl WorkerContext {
    fn record_failure(&self, error: Error) {
        let mut slot = self.failure.lock().expect("failure mutex poisoned");
        if slot.is_none() {
            tracing::error!("scan aborting: {error}");
            *slot = Some(error);
        }
    }

    fn has_failed(&self) -> bool {
        self.failure
            .lock()
            .expect("failure mutex poisoned")
            .is_some()
    }
}

/// Scans one media file against a hash database.
///
/// Opens the database read-only, streams the media through the worker
/// pool, and reports matches through `sink`. Returns the aggregate
/// counters, or the first fatal error the pipeline hit.
pub fn scan_media(
    hashdb_dir: &Path,
    media_path: &Path,
    config: &MediaScanConfig,
    sink: Arc<dyn MatchSink>,
) -> Result<ScanSummary> {
    let settings = Settings::read(hashdb_dir)?;
    config.validate(&settings)?;

    let env = Arc::new(StoreEnv::open(hashdb_dir, FileMode::ReadOnly)?);
    let scan_manager = ScanManager::new(hashdb_dir, settings.clone(), env)?;
    let reader = FileReader::open(media_path)?;
    let media_size = reader.filesize();

    let workers = config.worker_count();
    let queue = Arc::new(JobQueue::new(2 * workers));
    let context = Arc::new(WorkerContext {
        queue: Arc::clone(&queue),
        scan_manager,
        calculator: HashCalculator::new(settings.digest_algorithm, settings.block_size),
        tracker: ScanTracker::new(media_size),
        sink,
        config: config.clone(),
        failure: Mutex::new(None),
    });

    tracing::info!(
        "scanning {} ({media_size} bytes) with {workers} workers, step {}",
        media_path.display(),
        config.step_size
    );

    let pool = {
        let context = Arc::clone(&context);
        WorkerPool::spawn(workers, move |_| worker_loop(&context))
    };

    // Read chunks and feed the queue; push blocks when workers lag.
    let mut read_failure = None;
    let mut offset = 0u64;
    while offset < media_size {
        if context.has_failed() {
            break;
        }
        let want = BUFFER_SIZE.min((media_size - offset) as usize);
        let mut buffer = vec![0u8; want];
        match reader.read(offset, &mut buffer) {
            Ok(read) => {
                buffer.truncate(read);
                if read == 0 {
                    break;
                }
                let data_size = read.min(BUFFER_DATA_SIZE);
                queue.push(ScanJob::media_chunk(buffer, data_size, offset));
            }
            Err(err) => {
                // A read error aborts this file, not the pool.
                read_failure = Some(Error::Io(format!(
                    "read failed at offset {offset} of '{}': {err}",
                    media_path.display()
                )));
                break;
            }
        }
        offset += BUFFER_DATA_SIZE as u64;
    }

    queue.close();
    drop(pool);

    let worker_failure = context
        .failure
        .lock()
        .expect("failure mutex poisoned")
        .take();
    if let Some(err) = worker_failure {
        return Err(err);
    }
    if let Some(err) = read_failure {
        return Err(err);
    }

    Ok(ScanSummary {
        media_size,
        bytes_scanned: context.tracker.bytes_scanned(),
        zero_count: context.tracker.zero_count(),
        match_count: context.tracker.match_count(),
    })
}

fn worker_loop(context: &WorkerContext) {
    while let Some(job) = context.queue.pop() {
        if context.has_failed() {
            // Keep draining so the producer unblocks and teardown stays
            // orderly; the work itself is abandoned.
            continue;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| process_job(context, &job)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => context.record_failure(err),
            Err(_) => {
                tracing::error!(
                    "panic while scanning buffer at {} (depth {})",
                    job.stream_offset,
                    job.recursion_depth
                );
            }
        }
    }
}

fn process_job(context: &WorkerContext, job: &ScanJob) -> Result<()> {
    let block_size = context.calculator.block_size() as usize;
    let step = context.config.step_size as usize;

    let mut offset = 0;
    while offset < job.data_size {
        if offset + block_size > job.buffer.len() {
            break;
        }
        let block = &job.buffer[offset..offset + block_size];
        if is_all_zeros(block) {
            // Zero blocks are scanned but never reported; they swamp
            // match output.
            context.tracker.add_zero_blocks(1);
            offset += step;
            continue;
        }
        let digest = context.calculator.digest(block);
        report_block(context, job, offset, &digest)?;
        offset += step;
    }

    if job.recursion_depth == 0 {
        context.tracker.add_bytes(job.data_size as u64);
    }

    if context.config.process_embedded_data && job.recursion_depth < MAX_RECURSION_DEPTH {
        descend_embedded(context, job)?;
    }
    Ok(())
}

fn report_block(
    context: &WorkerContext,
    job: &ScanJob,
    offset: usize,
    digest: &[u8],
) -> Result<()> {
    let manager = &context.scan_manager;
    let payload = match context.config.scan_mode {
        ScanMode::CountOnly => {
            let count = manager.find_hash_count(digest)?;
            if count == 0 {
                return Ok(());
            }
            serde_json::json!({ "count": count })
        }
        ScanMode::Expanded => {
            match manager.find_expanded_hash(digest, context.config.max_expanded_sources)? {
                Some(record) => record.to_json(),
                None => return Ok(()),
            }
        }
        ScanMode::ExpandedOptimized => {
            let count = manager.find_hash_count(digest)?;
            if count == 0 {
                return Ok(());
            }
            if manager.first_sighting(digest) {
                match manager.find_expanded_hash(digest, context.config.max_expanded_sources)? {
                    Some(record) => record.to_json(),
                    None => return Ok(()),
                }
            } else {
                serde_json::json!({ "count": count })
            }
        }
    };

    context.tracker.add_match();
    context.sink.record(&MatchRecord {
        coordinate: job.match_coordinate(offset),
        block_hash: digest.to_vec(),
        payload,
    });
    Ok(())
}

fn descend_embedded(context: &WorkerContext, job: &ScanJob) -> Result<()> {
    let streams = find_embedded_streams(
        &job.buffer,
        job.data_size,
        MAX_EMBEDDED_STREAMS_PER_BUFFER,
        MAX_EMBEDDED_STREAM_BYTES,
    );
    for stream in streams {
        let child = ScanJob::embedded_stream(
            stream.data,
            job.recursion_depth + 1,
            job.child_path(stream.kind, stream.offset),
        );
        // Queue when there is room; otherwise recurse inline. With every
        // worker producing, blocking pushes could leave no consumer.
        if let Err(child) = context.queue.try_push(child) {
            process_job(context, &child)?;
        }
    }
    Ok(())
}
