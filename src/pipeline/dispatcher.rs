//! Bounded work queue, processing worker pool and in-order emission

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use flume::{RecvTimeoutError, SendTimeoutError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::algorithm::{AlgorithmRegistry, HeadSensor};
use super::data::{CalibrationParameters, ProcessedResult};
use super::left_right::LeftRightProcessor;
use crate::capture::{EyeCollection, FrameSet};
use crate::error::{Result, TrackerError};
use crate::status::Counter;
use crate::tasks::{CancelToken, TaskGroup};
use crate::PipelineSettings;

/// Receives every processed result, in enqueue order
pub type ResultCallback = Box<dyn FnMut(ProcessedResult) + Send>;

type WorkItem = (u64, FrameSet);

/// How often blocked workers and offline producers re-check cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingMode {
    /// A full queue drops the frame set; the grabber never waits
    #[default]
    RealTime,
    /// A full queue blocks the producer; nothing is dropped
    Offline,
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub workers: usize,
    pub buffer_size: usize,
    pub mode: ProcessingMode,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            buffer_size: 16,
            mode: ProcessingMode::RealTime,
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Frame sets offered while running
    pub submitted: Counter,
    /// Results emitted to the callback
    pub processed: Counter,
    /// Frame sets dropped at enqueue or left over after a fault
    pub not_processed: Counter,
    /// Per-eye algorithm failures, shared with every eye thread
    pub eye_failures: Arc<Counter>,
    /// Largest number of results held back waiting for an earlier one
    pub max_reorder_depth: Counter,
}

impl DispatcherStats {
    fn reset(&self) {
        self.submitted.reset();
        self.processed.reset();
        self.not_processed.reset();
        self.eye_failures.reset();
        self.max_reorder_depth.reset();
    }
}

/// Restores enqueue order from out-of-order completions.
///
/// Holds results ahead of the next expected sequence number and releases
/// them as soon as the gap before them closes.
pub(crate) struct Reorderer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Reorderer<T> {
    pub(crate) fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    pub(crate) fn complete(&mut self, sequence: u64, item: T, mut emit: impl FnMut(T)) {
        if sequence < self.next {
            warn!(sequence, next = self.next, "Duplicate sequence number ignored");
            return;
        }
        if sequence == self.next {
            emit(item);
            self.next += 1;
        } else {
            self.pending.insert(sequence, item);
        }
        while let Some(item) = self.pending.remove(&self.next) {
            emit(item);
            self.next += 1;
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.pending.len()
    }

    /// Drops results that can no longer be emitted and returns how many
    fn discard_pending(&mut self) -> usize {
        let stranded = self.pending.len();
        self.pending.clear();
        stranded
    }
}

struct Output {
    order: Reorderer<ProcessedResult>,
    on_result: Option<ResultCallback>,
}

/// State every worker reads
struct Shared {
    registry: Arc<AlgorithmRegistry>,
    settings: Arc<ArcSwap<PipelineSettings>>,
    calibration: Arc<ArcSwap<CalibrationParameters>>,
    head: Option<Arc<dyn HeadSensor>>,
    stats: Arc<DispatcherStats>,
    output: Mutex<Output>,
}

impl Shared {
    fn complete(&self, sequence: u64, result: ProcessedResult) {
        let mut output = self.output.lock();
        let Output { order, on_result } = &mut *output;
        order.complete(sequence, result, |result| {
            self.stats.processed.inc();
            metrics::counter!("binoc_items_processed_total").increment(1);
            if let Some(on_result) = on_result.as_mut() {
                on_result(result);
            }
        });
        self.stats.max_reorder_depth.max(order.depth() as u64);
    }
}

/// Enqueue side, owned by whoever calls `try_process_images`
struct Producer {
    queue: flume::Sender<WorkItem>,
    next_sequence: u64,
    token: CancelToken,
}

impl Producer {
    fn send_blocking(&self, mut item: WorkItem) -> bool {
        loop {
            match self.queue.send_timeout(item, POLL_INTERVAL) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) if !self.token.is_cancelled() => item = back,
                Err(_) => return false,
            }
        }
    }
}

struct Running {
    group: TaskGroup,
    queue: flume::Receiver<WorkItem>,
}

/// Decouples the grab rate from the processing rate.
///
/// Frame sets go through a bounded queue to a pool of workers, each with
/// its own [`LeftRightProcessor`]. Results are emitted to a single
/// callback strictly in enqueue order, whichever worker finishes first.
pub struct FrameDispatcher {
    options: DispatcherOptions,
    shared: Arc<Shared>,
    producer: Arc<Mutex<Option<Producer>>>,
    running: Mutex<Option<Running>>,
}

impl FrameDispatcher {
    pub fn new(
        options: DispatcherOptions,
        registry: Arc<AlgorithmRegistry>,
        settings: Arc<ArcSwap<PipelineSettings>>,
    ) -> Self {
        Self::with_head_sensor(options, registry, settings, None)
    }

    pub fn with_head_sensor(
        options: DispatcherOptions,
        registry: Arc<AlgorithmRegistry>,
        settings: Arc<ArcSwap<PipelineSettings>>,
        head: Option<Arc<dyn HeadSensor>>,
    ) -> Self {
        Self {
            options,
            shared: Arc::new(Shared {
                registry,
                settings,
                calibration: Arc::new(ArcSwap::from_pointee(CalibrationParameters::default())),
                head,
                stats: Arc::new(DispatcherStats::default()),
                output: Mutex::new(Output {
                    order: Reorderer::new(),
                    on_result: None,
                }),
            }),
            producer: Arc::new(Mutex::new(None)),
            running: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &DispatcherOptions {
        &self.options
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        self.shared.stats.clone()
    }

    /// Settings picked up by workers on their next frame set
    pub fn update_settings(&self, settings: PipelineSettings) {
        self.shared.settings.store(Arc::new(settings));
    }

    pub fn calibration(&self) -> Arc<CalibrationParameters> {
        self.shared.calibration.load_full()
    }

    pub fn set_calibration(&self, calibration: CalibrationParameters) {
        self.shared.calibration.store(Arc::new(calibration));
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn has_faulted(&self) -> bool {
        self.running.lock().as_ref().is_some_and(|running| running.group.has_faulted())
    }

    /// Frame sets waiting in the queue
    pub fn buffer_depth(&self) -> usize {
        self.running.lock().as_ref().map_or(0, |running| running.queue.len())
    }

    pub fn buffer_capacity(&self) -> usize {
        self.options.buffer_size.max(1)
    }

    pub fn start(&self, on_result: ResultCallback) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(TrackerError::AlreadyStarted("frame dispatcher"));
        }

        self.shared.stats.reset();
        *self.shared.output.lock() = Output {
            order: Reorderer::new(),
            on_result: Some(on_result),
        };

        let (queue_tx, queue_rx) = flume::bounded(self.buffer_capacity());
        let mut group = TaskGroup::new("frame-dispatcher");
        let producer = self.producer.clone();
        group.on_fault(move || {
            warn!("Processing worker failed, closing the dispatch queue");
            producer.lock().take();
        });
        *self.producer.lock() = Some(Producer {
            queue: queue_tx,
            next_sequence: 0,
            token: group.token(),
        });

        let workers = self.options.workers.max(1);
        for index in 0..workers {
            let shared = self.shared.clone();
            let queue = queue_rx.clone();
            if let Err(err) = group.spawn(format!("eye-worker-{index}"), move |token| {
                run_worker(index, shared, queue, token)
            }) {
                self.producer.lock().take();
                group.cancel();
                let _ = group.join();
                return Err(err);
            }
        }

        info!(
            workers,
            buffer_size = self.buffer_capacity(),
            mode = ?self.options.mode,
            "Frame dispatcher started"
        );
        *running = Some(Running {
            group,
            queue: queue_rx,
        });
        Ok(())
    }

    /// Offers a frame set for processing.
    ///
    /// In real-time mode a full queue rejects it at once; in offline mode
    /// the call waits for space. Returns false when the frame set was not
    /// taken, which is counted as not processed.
    pub fn try_process_images(&self, frames: FrameSet) -> bool {
        let mut producer = self.producer.lock();
        let Some(producer) = producer.as_mut() else {
            return false;
        };
        let stats = &self.shared.stats;
        stats.submitted.inc();

        let item = (producer.next_sequence, frames);
        let accepted = match self.options.mode {
            ProcessingMode::RealTime => producer.queue.try_send(item).is_ok(),
            ProcessingMode::Offline => producer.send_blocking(item),
        };
        if accepted {
            producer.next_sequence += 1;
            metrics::gauge!("binoc_processing_buffer_depth").set(producer.queue.len() as f64);
        } else {
            stats.not_processed.inc();
            metrics::counter!("binoc_items_not_processed_total").increment(1);
        }
        accepted
    }

    /// Closes the queue for new frame sets and waits for the workers to
    /// drain it. Re-raises worker faults. Calling it again is a no-op.
    pub fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };
        self.producer.lock().take();
        let result = running.group.join();

        // Only left behind when workers quit early after a fault
        let leftover = running.queue.drain().count();
        let stranded = {
            let mut output = self.shared.output.lock();
            output.on_result = None;
            output.order.discard_pending()
        };
        let stats = &self.shared.stats;
        stats.not_processed.add((leftover + stranded) as u64);
        metrics::gauge!("binoc_processing_buffer_depth").set(0.0);

        info!(
            submitted = stats.submitted.get(),
            processed = stats.processed.get(),
            not_processed = stats.not_processed.get(),
            eye_failures = stats.eye_failures.get(),
            max_reorder_depth = stats.max_reorder_depth.get(),
            "Frame dispatcher stopped"
        );
        result
    }
}

fn run_worker(
    index: usize,
    shared: Arc<Shared>,
    queue: flume::Receiver<WorkItem>,
    token: CancelToken,
) -> Result<()> {
    let mut processor = LeftRightProcessor::new(
        format!("worker-{index}"),
        shared.registry.clone(),
        shared.stats.eye_failures.clone(),
    )?;

    while !token.is_cancelled() {
        let (sequence, frames) = match queue.recv_timeout(POLL_INTERVAL) {
            Ok(item) => item,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let settings = shared.settings.load_full();
        let calibration = shared.calibration.load_full();
        let outputs = match processor.process_images(&frames, &settings, &calibration) {
            Ok(outputs) => outputs,
            Err(err) => {
                shared.stats.not_processed.inc();
                return Err(err);
            }
        };

        let mut eyes = EyeCollection::default();
        let mut torsion_images = EyeCollection::default();
        for (eye, output) in outputs.into_entries() {
            eyes.set(eye, output.data);
            if let Some(image) = output.torsion_image {
                torsion_images.set(eye, image);
            }
        }
        let calibrated = calibration.apply(&eyes);
        let result = ProcessedResult {
            sequence,
            frames,
            eyes,
            torsion_images,
            head: shared.head.as_ref().and_then(|sensor| sensor.latest()),
            calibrated,
        };
        shared.complete(sequence, result);
    }

    processor.stop();
    Ok(())
}
