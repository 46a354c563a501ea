//! Aggregate scan counters.
//!
//! Workers bump these with atomic fetch-adds; nothing here takes a lock.
//! Progress is reported through `tracing` at one-percent steps of the
//! media size as buffer data regions complete.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counters for one media scan.
pub struct ScanTracker {
    media_size: u64,
    bytes_scanned: AtomicU64,
    zero_count: AtomicU64,
    match_count: AtomicU64,
    last_reported_percent: AtomicU64,
}

impl ScanTracker {
    pub fn new(media_size: u64) -> Self {
        Self {
            media_size,
            bytes_scanned: AtomicU64::new(0),
            zero_count: AtomicU64::new(0),
            match_count: AtomicU64::new(0),
            last_reported_percent: AtomicU64::new(0),
        }
    }

    /// Accounts a completed buffer data region and reports progress when a
    /// one-percent boundary is crossed.
    pub fn add_bytes(&self, n: u64) {
        let total = self.bytes_scanned.fetch_add(n, Ordering::Relaxed) + n;
        if self.media_size == 0 {
            return;
        }
        let percent = (total.min(self.media_size)) * 100 / self.media_size;
        let last = self.last_reported_percent.load(Ordering::Relaxed);
        if percent > last
            && self
                .last_reported_percent
                .compare_exchange(last, percent, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            tracing::info!("scanned {total} of {} bytes ({percent}%)", self.media_size);
        }
    }

    pub fn add_zero_blocks(&self, n: u64) {
        self.zero_count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_match(&self) {
        self.match_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_scanned(&self) -> u64 {
        self.bytes_scanned.load(Ordering::Relaxed)
    }

    pub fn zero_count(&self) -> u64 {
        self.zero_count.load(Ordering::Relaxed)
    }

    pub fn match_count(&self) -> u64 {
        self.match_count.load(Ordering::Relaxed)
    }
}
