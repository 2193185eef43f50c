//! Bounded single-consumer buffer with a designated last item

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, TrackerError};
use crate::status::Counter;
use crate::tasks::TaskGroup;

/// Where a [`BoundedConsumer`] delivers its items, on its own thread
pub trait ConsumerSink<T>: Send + 'static {
    fn consume(&mut self, item: T) -> Result<()>;

    /// Called once after the last item, e.g. to flush files
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Adapts a closure into a sink
pub struct FnSink<F>(pub F);

impl<T, F> ConsumerSink<T> for FnSink<F>
where
    F: FnMut(T) -> Result<()> + Send + 'static,
{
    fn consume(&mut self, item: T) -> Result<()> {
        (self.0)(item)
    }
}

const NONE: u64 = u64::MAX;

#[derive(Debug)]
pub struct ConsumerStats {
    pub added: Counter,
    pub dropped: Counter,
    pub consumed: Counter,
    first_item: AtomicU64,
    last_item: AtomicU64,
}

impl Default for ConsumerStats {
    fn default() -> Self {
        Self {
            added: Counter::default(),
            dropped: Counter::default(),
            consumed: Counter::default(),
            first_item: AtomicU64::new(NONE),
            last_item: AtomicU64::new(NONE),
        }
    }
}

impl ConsumerStats {
    /// Number of the first item accepted
    pub fn first_item(&self) -> Option<u64> {
        Some(self.first_item.load(Ordering::Relaxed)).filter(|n| *n != NONE)
    }

    /// Number of the most recent item accepted
    pub fn last_item(&self) -> Option<u64> {
        Some(self.last_item.load(Ordering::Relaxed)).filter(|n| *n != NONE)
    }
}

/// Producer-side gate; closing it drops the sender so the consumer
/// thread drains what is buffered and exits
struct Gate<T> {
    queue: Option<flume::Sender<T>>,
    last_wanted: Option<u64>,
    last_added: Option<u64>,
    /// Dropping it cancels a pending forced close
    deadline: Option<flume::Sender<()>>,
}

impl<T> Gate<T> {
    fn close(&mut self) {
        self.queue = None;
        self.deadline = None;
    }
}

/// A bounded buffer drained by one dedicated thread.
///
/// The producer never blocks: `try_add` rejects an item when the buffer
/// is full or closed. `stop_at` names the last item to consume; the
/// buffer stays open until that item has been added, or is forced
/// closed once the timeout expires. Whatever was buffered when it
/// closes is still consumed.
pub struct BoundedConsumer<T: Send + 'static> {
    name: String,
    capacity: usize,
    gate: Arc<Mutex<Gate<T>>>,
    receiver: Mutex<Option<flume::Receiver<T>>>,
    stats: Arc<ConsumerStats>,
    worker: Mutex<Option<TaskGroup>>,
    deadline: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> BoundedConsumer<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = flume::bounded(capacity);
        Self {
            name: name.into(),
            capacity,
            gate: Arc::new(Mutex::new(Gate {
                queue: Some(tx),
                last_wanted: None,
                last_added: None,
                deadline: None,
            })),
            receiver: Mutex::new(Some(rx)),
            stats: Arc::new(ConsumerStats::default()),
            worker: Mutex::new(None),
            deadline: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.gate.lock().queue.is_none()
    }

    /// Items buffered and not yet consumed
    pub fn len(&self) -> usize {
        if let Some(queue) = self.receiver.lock().as_ref() {
            return queue.len();
        }
        self.gate.lock().queue.as_ref().map_or(0, flume::Sender::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offers item `number`. Never blocks. Items past the designated
    /// last one are refused without counting as dropped.
    pub fn try_add(&self, item: T, number: u64) -> bool {
        let mut gate = self.gate.lock();
        // Numbers only grow, so passing the last item means it was skipped upstream
        if gate.last_wanted.is_some_and(|last| number > last) {
            if gate.queue.is_some() {
                debug!(consumer = %self.name, number, "Passed the last item, closing");
                gate.close();
            }
            return false;
        }
        let accepted = gate
            .queue
            .as_ref()
            .is_some_and(|queue| queue.try_send(item).is_ok());

        if !accepted {
            self.stats.dropped.inc();
            return false;
        }
        self.stats.added.inc();
        let _ = self
            .stats
            .first_item
            .compare_exchange(NONE, number, Ordering::Relaxed, Ordering::Relaxed);
        self.stats.last_item.store(number, Ordering::Relaxed);
        gate.last_added = Some(number);
        if gate.last_wanted == Some(number) {
            gate.close();
        }
        true
    }

    /// Closes the buffer now
    pub fn stop(&self) {
        let mut gate = self.gate.lock();
        if gate.queue.is_some() {
            debug!(consumer = %self.name, "Closing");
            gate.close();
        }
    }

    /// Consumes up to and including item `last`, closing once it has
    /// been added or when `timeout` expires, whichever comes first.
    /// Does nothing if already closed or already stopping.
    pub fn stop_at(&self, last: u64, timeout: Duration) {
        let mut gate = self.gate.lock();
        if gate.queue.is_none() || gate.last_wanted.is_some() {
            return;
        }
        gate.last_wanted = Some(last);
        if gate.last_added.is_some_and(|added| added >= last) {
            gate.close();
            return;
        }

        let (cancel_tx, cancel_rx) = flume::bounded::<()>(0);
        gate.deadline = Some(cancel_tx);
        let weak_gate = Arc::downgrade(&self.gate);
        let name = self.name.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-deadline", self.name))
            .spawn(move || {
                if let Err(flume::RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
                    if let Some(gate) = weak_gate.upgrade() {
                        warn!(
                            consumer = %name,
                            last,
                            "Last item did not arrive in time, forcing close"
                        );
                        gate.lock().close();
                    }
                }
            });
        match spawned {
            Ok(handle) => *self.deadline.lock() = Some(handle),
            Err(err) => {
                warn!(
                    consumer = %self.name,
                    error = %err,
                    "Cannot schedule forced close, closing now"
                );
                gate.close();
            }
        }
    }

    /// Runs the consumption loop on a dedicated thread
    pub fn start(&self, mut sink: impl ConsumerSink<T>) -> Result<()> {
        let mut worker = self.worker.lock();
        let Some(queue) = self.receiver.lock().take() else {
            return Err(TrackerError::AlreadyStarted("bounded consumer"));
        };

        let mut group = TaskGroup::new(self.name.clone());
        let gate = self.gate.clone();
        group.on_fault(move || gate.lock().close());

        let stats = self.stats.clone();
        let name = self.name.clone();
        group.spawn(self.name.clone(), move |_| {
            info!(consumer = %name, "Consumer started");
            for item in queue.iter() {
                sink.consume(item)?;
                stats.consumed.inc();
            }
            sink.finish()?;
            info!(
                consumer = %name,
                added = stats.added.get(),
                dropped = stats.dropped.get(),
                consumed = stats.consumed.get(),
                "Consumer finished"
            );
            Ok(())
        })?;
        *worker = Some(group);
        Ok(())
    }

    /// Waits for the consumer thread to drain the buffer and exit, and
    /// re-raises a sink failure. Only returns once the buffer was closed
    /// by `stop`, `stop_at` or a fault.
    pub fn wait(&self) -> Result<()> {
        let group = self.worker.lock().take();
        let result = group.map_or(Ok(()), TaskGroup::join);
        if let Some(handle) = self.deadline.lock().take() {
            let _ = handle.join();
        }
        result
    }
}

impl<T: Send + 'static> Drop for BoundedConsumer<T> {
    fn drop(&mut self) {
        self.stop();
        if let Err(err) = self.wait() {
            warn!(consumer = %self.name, error = %err, "Consumer failed");
        }
    }
}
