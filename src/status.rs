//! Counters and the read-only status snapshot polled by a UI

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counter read with relaxed ordering. Values seen from other
/// threads are eventually consistent and only meant for display.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn max(&self, value: u64) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.set(0);
    }
}

/// `f64` stored in an atomic as its bit pattern
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Snapshot of one tracking session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerStatus {
    pub running: bool,
    pub grabbed: u64,
    pub dropped: u64,
    pub frame_rate: f64,
    pub processed: u64,
    pub not_processed: u64,
    pub buffer_depth: usize,
    pub buffer_capacity: usize,
    pub eye_failures: u64,
    pub recording: bool,
    pub calibrating: bool,
}

impl TrackerStatus {
    /// Frames the cameras skipped, relative to everything they numbered
    pub fn grab_drop_percentage(&self) -> f64 {
        percentage(self.dropped, self.grabbed + self.dropped)
    }

    /// Frame sets the processor could not take, relative to everything offered
    pub fn processing_drop_percentage(&self) -> f64 {
        percentage(self.not_processed, self.processed + self.not_processed)
    }

    pub fn grab_summary(&self) -> String {
        format!(
            "Grabbed: {} Dropped: {} ({:.1}%) @ {:.1} fps",
            self.grabbed,
            self.dropped,
            self.grab_drop_percentage(),
            self.frame_rate
        )
    }

    pub fn processing_summary(&self) -> String {
        format!(
            "Processed: {} Not processed: {} ({:.1}%) Buffer: {}/{}",
            self.processed,
            self.not_processed,
            self.processing_drop_percentage(),
            self.buffer_depth,
            self.buffer_capacity
        )
    }
}

impl fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {}", self.grab_summary(), self.processing_summary())?;
        if self.recording {
            write!(f, " | REC")?;
        }
        if self.calibrating {
            write!(f, " | CAL")?;
        }
        Ok(())
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}
