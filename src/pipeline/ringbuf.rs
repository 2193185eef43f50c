//! Drop-oldest ring of recent results for UI previews

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use super::data::ProcessedResult;

/// Keeps the most recent processed results.
///
/// Pushing never blocks and never fails: when the ring is full the oldest
/// result is overwritten. A UI polls `latest` or drains with `pop`.
pub struct PreviewRing {
    ring: Mutex<HeapRb<Arc<ProcessedResult>>>,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    written: AtomicUsize,
    read: AtomicUsize,
    overwritten: AtomicUsize,
}

impl PreviewRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(HeapRb::new(capacity.max(1))),
            stats: CachePadded::new(Stats::default()),
        }
    }

    pub fn push(&self, result: ProcessedResult) {
        let mut ring = self.ring.lock();
        if ring.is_full() {
            self.stats.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        let _ = ring.push_overwrite(Arc::new(result));
        self.stats.written.fetch_add(1, Ordering::Relaxed);
    }

    /// Oldest result still held
    pub fn pop(&self) -> Option<Arc<ProcessedResult>> {
        let result = self.ring.lock().try_pop()?;
        self.stats.read.fetch_add(1, Ordering::Relaxed);
        Some(result)
    }

    /// Most recent result, left in the ring
    pub fn latest(&self) -> Option<Arc<ProcessedResult>> {
        self.ring.lock().iter().last().cloned()
    }

    /// Everything held, oldest first
    pub fn snapshot(&self) -> Vec<Arc<ProcessedResult>> {
        self.ring.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (written, read, overwritten)
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.written.load(Ordering::Relaxed),
            self.stats.read.load(Ordering::Relaxed),
            self.stats.overwritten.load(Ordering::Relaxed),
        )
    }
}
