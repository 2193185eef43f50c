//! Grab loop turning one or two sources into an ordered stream of frame sets

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::frame::{Eye, EyeCollection, FrameSet};
use super::source::{Direction, FrameSource, Grab, SourceMode};
use super::synchronizer::{MultiSourceSynchronizer, SyncOutcome};
use crate::error::{Result, TrackerError};
use crate::status::{Counter, Gauge};
use crate::tasks::{CancelToken, TaskGroup};
use crate::utils;

/// Receives every frame set on the grab-loop thread
pub type FrameSetCallback = Box<dyn FnMut(FrameSet) + Send>;

type SharedSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// How long the synchronized loop waits for camera input before it
/// re-checks for cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const RATE_WINDOW: Duration = Duration::from_secs(1);
/// Relative frame-rate difference tolerated between two cameras
const FRAME_RATE_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct GrabberOptions {
    /// Pin camera threads to their own CPU cores
    pub pin_threads: bool,
    pub sync_queue_limit: usize,
}

impl Default for GrabberOptions {
    fn default() -> Self {
        Self {
            pin_threads: false,
            sync_queue_limit: 100,
        }
    }
}

/// Written only by the grab loop, read by anyone
#[derive(Debug, Default)]
pub struct GrabberStats {
    pub grabbed: Counter,
    pub dropped: Counter,
    pub last_frame_number: Counter,
    pub sync_discarded: Counter,
    frame_rate: Gauge,
}

impl GrabberStats {
    pub fn frame_rate(&self) -> f64 {
        self.frame_rate.get()
    }

    fn reset(&self) {
        self.grabbed.reset();
        self.dropped.reset();
        self.last_frame_number.reset();
        self.sync_discarded.reset();
        self.frame_rate.set(0.0);
    }
}

/// Counts frames missing between consecutively emitted frame numbers
struct DropTracker {
    counts_drops: bool,
    last: Option<u64>,
}

impl DropTracker {
    fn new(mode: SourceMode) -> Self {
        Self {
            counts_drops: mode == SourceMode::Camera,
            last: None,
        }
    }

    fn record(&mut self, stats: &GrabberStats, frame_number: u64) {
        if self.counts_drops {
            if let Some(last) = self.last {
                if frame_number > last + 1 {
                    let gap = frame_number - last - 1;
                    stats.dropped.add(gap);
                    metrics::counter!("binoc_frames_dropped_total").increment(gap);
                }
            }
        }
        self.last = Some(frame_number);
        stats.grabbed.inc();
        stats.last_frame_number.set(frame_number);
        metrics::counter!("binoc_frames_grabbed_total").increment(1);
    }
}

/// Differential frame-rate sample over roughly one-second windows
struct RateSampler {
    since: Instant,
    grabbed: u64,
}

impl RateSampler {
    fn new() -> Self {
        Self {
            since: Instant::now(),
            grabbed: 0,
        }
    }

    fn sample(&mut self, stats: &GrabberStats) {
        let elapsed = self.since.elapsed();
        if elapsed < RATE_WINDOW {
            return;
        }
        let grabbed = stats.grabbed.get();
        stats
            .frame_rate
            .set(grabbed.saturating_sub(self.grabbed) as f64 / elapsed.as_secs_f64());
        self.since = Instant::now();
        self.grabbed = grabbed;
    }
}

/// Owns the eye sources and the threads grabbing from them.
///
/// With a single source one loop thread grabs and invokes the callback.
/// With two sources each camera gets its own thread feeding a
/// [`MultiSourceSynchronizer`], and the loop thread emits only matched
/// sets. A fault in any thread stops all of them; `stop` re-raises it.
pub struct ImageGrabber {
    sources: Vec<SharedSource>,
    eyes: Vec<Eye>,
    mode: SourceMode,
    options: GrabberOptions,
    stats: Arc<GrabberStats>,
    running: Mutex<Option<TaskGroup>>,
}

impl ImageGrabber {
    pub fn new(
        sources: EyeCollection<Box<dyn FrameSource>>,
        options: GrabberOptions,
    ) -> Result<Self> {
        if sources.is_empty() {
            return Err(TrackerError::NoSources);
        }
        for (eye, source) in sources.iter() {
            if source.eye() != eye {
                return Err(TrackerError::SourceMismatch(format!(
                    "source '{}' delivers {} images but is configured for the {} eye",
                    source.name(),
                    source.eye().label(),
                    eye.label()
                )));
            }
        }
        if let (Some(left), Some(right)) = (sources.get(Eye::Left), sources.get(Eye::Right)) {
            validate_pair(left.as_ref(), right.as_ref())?;
        }

        let eyes = sources.eyes();
        let mode = sources
            .iter()
            .map(|(_, source)| source.mode())
            .next()
            .unwrap_or(SourceMode::Camera);
        let sources = sources
            .into_entries()
            .map(|(_, source)| Arc::new(Mutex::new(source)))
            .collect();

        Ok(Self {
            sources,
            eyes,
            mode,
            options,
            stats: Arc::new(GrabberStats::default()),
            running: Mutex::new(None),
        })
    }

    pub fn eyes(&self) -> &[Eye] {
        &self.eyes
    }

    pub fn mode(&self) -> SourceMode {
        self.mode
    }

    pub fn stats(&self) -> Arc<GrabberStats> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// True when the grab threads ended on their own (end of stream or fault)
    pub fn is_finished(&self) -> bool {
        self.running.lock().as_ref().is_some_and(TaskGroup::is_finished)
    }

    pub fn has_faulted(&self) -> bool {
        self.running.lock().as_ref().is_some_and(TaskGroup::has_faulted)
    }

    /// Starts the sources and the grab threads. Fails if already started.
    pub fn start(&self, callback: FrameSetCallback) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(TrackerError::AlreadyStarted("image grabber"));
        }

        self.start_sources()?;
        self.stats.reset();

        let mut group = TaskGroup::new("image-grabber");
        let token = group.token();
        group.on_fault(move || {
            warn!("Grab thread failed, stopping all grab threads");
            token.cancel();
        });

        if let Err(err) = self.spawn_loops(&mut group, callback) {
            group.cancel();
            let _ = group.join();
            self.stop_sources();
            return Err(err);
        }

        info!(eyes = ?self.eyes, mode = ?self.mode, threads = group.len(), "Image grabber started");
        *running = Some(group);
        Ok(())
    }

    /// Signals the grab threads to finish their current grab and exit,
    /// waits for them and stops the sources. Calling it again is a no-op.
    pub fn stop(&self) -> Result<()> {
        let Some(group) = self.running.lock().take() else {
            return Ok(());
        };
        group.cancel();
        let result = group.join();
        self.stop_sources();

        info!(
            grabbed = self.stats.grabbed.get(),
            dropped = self.stats.dropped.get(),
            discarded = self.stats.sync_discarded.get(),
            "Image grabber stopped"
        );
        result
    }

    /// Re-centers the region of interest of a movable source.
    /// Returns false when the source has no such capability.
    pub fn center(&self, eye: Eye, point: (u32, u32)) -> bool {
        self.with_movable(eye, |movable| movable.center(point))
    }

    pub fn move_roi(&self, eye: Eye, direction: Direction) -> bool {
        self.with_movable(eye, |movable| movable.move_by(direction))
    }

    fn with_movable(
        &self,
        eye: Eye,
        f: impl FnOnce(&mut dyn super::source::MovableSource),
    ) -> bool {
        let Some(slot) = self.eyes.iter().position(|e| *e == eye) else {
            return false;
        };
        let mut source = self.sources[slot].lock();
        match source.as_movable() {
            Some(movable) => {
                f(movable);
                true
            }
            None => false,
        }
    }

    fn start_sources(&self) -> Result<()> {
        for (index, source) in self.sources.iter().enumerate() {
            if let Err(err) = source.lock().start() {
                for started in &self.sources[..index] {
                    let _ = started.lock().stop();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn stop_sources(&self) {
        for source in &self.sources {
            let mut source = source.lock();
            if let Err(err) = source.stop() {
                warn!(source = source.name(), error = %err, "Failed to stop source");
            }
        }
    }

    fn spawn_loops(&self, group: &mut TaskGroup, callback: FrameSetCallback) -> Result<()> {
        let stats = self.stats.clone();
        let mode = self.mode;
        let pin = self.options.pin_threads;

        if let [source] = self.sources.as_slice() {
            let source = source.clone();
            let name = format!("grab-{}", self.eyes[0].label());
            return group.spawn(name, move |token| {
                run_single(source, stats, callback, mode, pin, token)
            });
        }

        let (intake, frames) = flume::unbounded();
        for (slot, source) in self.sources.iter().enumerate() {
            let source = source.clone();
            let intake = intake.clone();
            group.spawn(format!("grab-{}", self.eyes[slot].label()), move |token| {
                run_camera(slot, source, intake, pin, token)
            })?;
        }
        drop(intake);

        let sync =
            MultiSourceSynchronizer::new(frames, self.eyes.clone(), self.options.sync_queue_limit);
        group.spawn("grab-sync", move |token| {
            run_synchronized(sync, stats, callback, mode, token)
        })
    }
}

fn validate_pair(left: &dyn FrameSource, right: &dyn FrameSource) -> Result<()> {
    let (left_rate, right_rate) = (left.frame_rate(), right.frame_rate());
    if (left_rate - right_rate).abs() > FRAME_RATE_TOLERANCE * left_rate.max(right_rate) {
        return Err(TrackerError::SourceMismatch(format!(
            "frame rates differ: left {left_rate:.2} fps, right {right_rate:.2} fps"
        )));
    }
    if left.frame_size() != right.frame_size() {
        return Err(TrackerError::SourceMismatch(format!(
            "frame sizes differ: left {:?}, right {:?}",
            left.frame_size(),
            right.frame_size()
        )));
    }
    if left.mode() != right.mode() {
        return Err(TrackerError::SourceMismatch(
            "cannot mix a camera and a video".to_string(),
        ));
    }
    Ok(())
}

fn run_single(
    source: SharedSource,
    stats: Arc<GrabberStats>,
    mut callback: FrameSetCallback,
    mode: SourceMode,
    pin: bool,
    token: CancelToken,
) -> Result<()> {
    if pin {
        utils::pin_current_thread(0);
    }
    let mut drops = DropTracker::new(mode);
    let mut rate = RateSampler::new();

    while !token.is_cancelled() {
        let grab = source.lock().grab_next()?;
        match grab {
            Grab::Frame(frame) => {
                let frames = FrameSet::single(frame);
                drops.record(&stats, frames.frame_number);
                callback(frames);
            }
            Grab::Timeout => {}
            Grab::EndOfStream => {
                info!("Source reached end of stream");
                break;
            }
        }
        rate.sample(&stats);
    }
    Ok(())
}

fn run_camera(
    slot: usize,
    source: SharedSource,
    intake: flume::Sender<super::frame::Frame>,
    pin: bool,
    token: CancelToken,
) -> Result<()> {
    if pin {
        utils::pin_current_thread(slot);
    }
    while !token.is_cancelled() {
        let grab = source.lock().grab_next()?;
        match grab {
            Grab::Frame(frame) => {
                if intake.send(frame).is_err() {
                    break;
                }
            }
            Grab::Timeout => {}
            Grab::EndOfStream => {
                info!(slot, "Camera reached end of stream");
                break;
            }
        }
    }
    Ok(())
}

fn run_synchronized(
    mut sync: MultiSourceSynchronizer,
    stats: Arc<GrabberStats>,
    mut callback: FrameSetCallback,
    mode: SourceMode,
    token: CancelToken,
) -> Result<()> {
    let mut drops = DropTracker::new(mode);
    let mut rate = RateSampler::new();

    while !token.is_cancelled() {
        match sync.next(POLL_INTERVAL) {
            SyncOutcome::Ready(frames) => {
                drops.record(&stats, frames.frame_number);
                callback(frames);
            }
            SyncOutcome::NotYetAvailable => {}
            SyncOutcome::Closed => {
                info!("All cameras closed");
                break;
            }
        }
        stats.sync_discarded.set(sync.discarded());
        rate.sample(&stats);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::ScriptedSource;
    use std::thread;

    fn scripted(eye: Eye, numbers: impl IntoIterator<Item = u64>) -> Box<dyn FrameSource> {
        boxed(ScriptedSource::new(eye, numbers))
    }

    fn boxed(source: ScriptedSource) -> Box<dyn FrameSource> {
        Box::new(source)
    }

    fn collecting() -> (FrameSetCallback, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Box::new(move |frames: FrameSet| sink.lock().push(frames.frame_number)), seen)
    }

    fn wait_finished(grabber: &ImageGrabber) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !grabber.is_finished() {
            assert!(Instant::now() < deadline, "grabber did not finish");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_single_camera_counts_gaps_as_drops() {
        let grabber = ImageGrabber::new(
            EyeCollection::single(Eye::Left, scripted(Eye::Left, [1, 2, 5, 6, 10])),
            GrabberOptions::default(),
        )
        .unwrap();
        let (callback, seen) = collecting();
        grabber.start(callback).unwrap();
        wait_finished(&grabber);
        grabber.stop().unwrap();

        assert_eq!(*seen.lock(), vec![1, 2, 5, 6, 10]);
        let stats = grabber.stats();
        assert_eq!(stats.grabbed.get(), 5);
        assert_eq!(stats.dropped.get(), 5);
        assert_eq!(stats.last_frame_number.get(), 10);
    }

    #[test]
    fn test_video_mode_does_not_count_drops() {
        let source = boxed(ScriptedSource::new(Eye::Right, [1, 3, 8]).as_video());
        let grabber = ImageGrabber::new(
            EyeCollection::single(Eye::Right, source),
            GrabberOptions::default(),
        )
        .unwrap();
        let (callback, _) = collecting();
        grabber.start(callback).unwrap();
        wait_finished(&grabber);
        grabber.stop().unwrap();
        assert_eq!(grabber.stats().grabbed.get(), 3);
        assert_eq!(grabber.stats().dropped.get(), 0);
    }

    #[test]
    fn test_dual_cameras_emit_only_matched_sets() {
        let grabber = ImageGrabber::new(
            EyeCollection::new(
                Some(scripted(Eye::Left, [1, 2, 3, 4])),
                Some(scripted(Eye::Right, [1, 3, 4])),
            ),
            GrabberOptions::default(),
        )
        .unwrap();
        let (callback, seen) = collecting();
        grabber.start(callback).unwrap();
        wait_finished(&grabber);
        grabber.stop().unwrap();

        assert_eq!(*seen.lock(), vec![1, 3, 4]);
        assert_eq!(grabber.stats().dropped.get(), 1);
        assert_eq!(grabber.stats().sync_discarded.get(), 1);
    }

    #[test]
    fn test_start_twice_fails_and_stop_is_idempotent() {
        let source =
            ScriptedSource::new(Eye::Left, 1..=1_000).with_interval(Duration::from_millis(1));
        let grabber = ImageGrabber::new(
            EyeCollection::single(Eye::Left, boxed(source)),
            GrabberOptions::default(),
        )
        .unwrap();
        let (callback, _) = collecting();
        grabber.start(callback).unwrap();

        let (again, _) = collecting();
        assert!(matches!(grabber.start(again), Err(TrackerError::AlreadyStarted(_))));

        grabber.stop().unwrap();
        let grabbed = grabber.stats().grabbed.get();
        grabber.stop().unwrap();
        assert_eq!(grabber.stats().grabbed.get(), grabbed);
        assert!(!grabber.is_running());
    }

    #[test]
    fn test_camera_fault_stops_partner_and_is_reraised() {
        let left =
            ScriptedSource::new(Eye::Left, 1..=100_000).with_interval(Duration::from_millis(1));
        let right = ScriptedSource::new(Eye::Right, 1..=100_000)
            .with_interval(Duration::from_millis(1))
            .failing_after(5);
        let grabber = ImageGrabber::new(
            EyeCollection::new(Some(boxed(left)), Some(boxed(right))),
            GrabberOptions::default(),
        )
        .unwrap();
        let (callback, _) = collecting();
        grabber.start(callback).unwrap();
        wait_finished(&grabber);

        assert!(grabber.has_faulted());
        let err = grabber.stop().unwrap_err();
        assert!(matches!(err, TrackerError::Source { .. }));
    }

    #[test]
    fn test_mismatched_frame_rates_are_rejected() {
        let left = ScriptedSource::new(Eye::Left, [1]).with_frame_rate(100.0);
        let right = ScriptedSource::new(Eye::Right, [1]).with_frame_rate(60.0);
        let result = ImageGrabber::new(
            EyeCollection::new(Some(boxed(left)), Some(boxed(right))),
            GrabberOptions::default(),
        );
        assert!(matches!(result, Err(TrackerError::SourceMismatch(_))));
    }

    #[test]
    fn test_source_configured_for_wrong_eye_is_rejected() {
        let result = ImageGrabber::new(
            EyeCollection::single(Eye::Left, scripted(Eye::Right, [1])),
            GrabberOptions::default(),
        );
        assert!(matches!(result, Err(TrackerError::SourceMismatch(_))));
    }

    #[test]
    fn test_roi_commands_without_movable_source() {
        let grabber = ImageGrabber::new(
            EyeCollection::single(Eye::Left, scripted(Eye::Left, [1])),
            GrabberOptions::default(),
        )
        .unwrap();
        assert!(!grabber.center(Eye::Left, (10, 10)));
        assert!(!grabber.move_roi(Eye::Right, Direction::Up));
    }
}
