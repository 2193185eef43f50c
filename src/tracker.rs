//! A tracking session: sources, grabber, dispatcher and consumers wired together

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use tracing::{info, instrument, warn};

use crate::capture::{
    Direction, Eye, EyeCollection, FrameSet, FrameSource, GrabberOptions, ImageGrabber,
    SourceRegistry,
};
use crate::error::{Result, TrackerError};
use crate::pipeline::{
    AlgorithmRegistry, CalibrationParameters, DispatcherOptions, FrameDispatcher, HeadSensor,
    PreviewRing, ProcessedResult,
};
use crate::session::{CalibrationSession, Recorder, RecorderOptions};
use crate::status::TrackerStatus;
use crate::{utils, Config, PipelineSettings};

struct Session {
    grabber: Arc<ImageGrabber>,
    dispatcher: Arc<FrameDispatcher>,
    started: Instant,
}

/// Runs tracking sessions from a [`Config`].
///
/// Frame sets flow from the grabber into the dispatcher; each processed
/// result is then offered to the recorder, the calibration session and
/// the preview ring, none of which can hold up processing.
pub struct EyeTracker {
    config: Config,
    sources: SourceRegistry,
    algorithms: Arc<AlgorithmRegistry>,
    settings: Arc<ArcSwap<PipelineSettings>>,
    calibration: ArcSwap<CalibrationParameters>,
    head: Option<Arc<dyn HeadSensor>>,
    session: Mutex<Option<Session>>,
    recorder: Arc<ArcSwapOption<Recorder>>,
    calibrating: Arc<ArcSwapOption<CalibrationSession>>,
    preview: Arc<PreviewRing>,
}

impl EyeTracker {
    pub fn new(config: Config) -> Self {
        Self::with_registries(
            config,
            SourceRegistry::with_defaults(),
            AlgorithmRegistry::with_defaults(),
        )
    }

    pub fn with_registries(
        config: Config,
        sources: SourceRegistry,
        algorithms: AlgorithmRegistry,
    ) -> Self {
        Self {
            settings: Arc::new(ArcSwap::from_pointee(config.processing.pipeline.clone())),
            preview: Arc::new(PreviewRing::new(config.recording.preview_size)),
            config,
            sources,
            algorithms: Arc::new(algorithms),
            calibration: ArcSwap::from_pointee(CalibrationParameters::default()),
            head: None,
            session: Mutex::new(None),
            recorder: Arc::new(ArcSwapOption::empty()),
            calibrating: Arc::new(ArcSwapOption::empty()),
        }
    }

    /// Head-motion samples fused into every result of later sessions
    pub fn set_head_sensor(&mut self, sensor: Arc<dyn HeadSensor>) {
        self.head = Some(sensor);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    /// True once every source ended or a grab or processing thread failed
    pub fn is_finished(&self) -> bool {
        self.session.lock().as_ref().is_some_and(|session| {
            session.grabber.is_finished()
                || session.grabber.has_faulted()
                || session.dispatcher.has_faulted()
        })
    }

    #[instrument(skip_all)]
    pub fn start(&self) -> Result<()> {
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(TrackerError::AlreadyStarted("eye tracker"));
        }

        let pipeline = self.settings.load();
        if !self.algorithms.contains(&pipeline.name) {
            return Err(TrackerError::UnknownPipeline(pipeline.name.clone()));
        }

        let grabber = Arc::new(ImageGrabber::new(
            self.open_sources()?,
            GrabberOptions {
                pin_threads: self.config.capture.pin_grab_threads,
                sync_queue_limit: self.config.capture.sync_queue_limit,
            },
        )?);

        let processing = &self.config.processing;
        let dispatcher = Arc::new(FrameDispatcher::with_head_sensor(
            DispatcherOptions {
                workers: utils::worker_count(processing.max_workers),
                buffer_size: processing.buffer_size,
                mode: processing.mode,
            },
            self.algorithms.clone(),
            self.settings.clone(),
            self.head.clone(),
        ));
        dispatcher.set_calibration((*self.calibration.load_full()).clone());

        let recorder = self.recorder.clone();
        let calibrating = self.calibrating.clone();
        let preview = self.preview.clone();
        dispatcher.start(Box::new(move |result: ProcessedResult| {
            if let Some(recorder) = &*recorder.load() {
                recorder.try_record_images_and_data(&result);
            }
            if let Some(calibration) = &*calibrating.load() {
                calibration.try_add(&result);
            }
            preview.push(result);
        }))?;

        let recorder = self.recorder.clone();
        let sink = dispatcher.clone();
        let started = grabber.start(Box::new(move |frames: FrameSet| {
            if let Some(recorder) = &*recorder.load() {
                recorder.try_record_images(&frames);
            }
            sink.try_process_images(frames);
        }));
        if let Err(err) = started {
            if let Err(stop_err) = dispatcher.stop() {
                warn!(error = %stop_err, "Dispatcher failed while aborting start");
            }
            return Err(err);
        }

        info!(
            eyes = ?grabber.eyes(),
            workers = dispatcher.options().workers,
            pipeline = %pipeline.name,
            "Tracking started"
        );
        *session = Some(Session {
            grabber,
            dispatcher,
            started: Instant::now(),
        });
        Ok(())
    }

    /// Stops grabbing, drains processing, then finishes any recording and
    /// calibration. Re-raises every fault of the session. Calling it
    /// again is a no-op.
    pub fn stop(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        let mut errors = Vec::new();
        errors.extend(session.grabber.stop().err());
        errors.extend(session.dispatcher.stop().err());

        // Both producers are stopped, nothing more can arrive
        errors.extend(self.finish_recording(None).err());
        if let Some(calibration) = self.calibrating.swap(None) {
            calibration.cancel();
        }

        let mut status = self.status_of(Some(&session));
        status.running = false;
        info!(elapsed = ?session.started.elapsed(), %status, "Tracking stopped");
        TrackerError::combine(errors)
    }

    pub fn start_recording(&self, dir: &Path) -> Result<()> {
        if !self.is_running() {
            return Err(TrackerError::NotRunning("eye tracker"));
        }
        if self.recorder.load().is_some() {
            return Err(TrackerError::AlreadyStarted("recording"));
        }
        let recorder = Recorder::start(
            dir,
            RecorderOptions {
                buffer_size: self.config.recording.buffer_size,
                images: self.config.recording.images,
            },
        )?;
        self.recorder.store(Some(Arc::new(recorder)));
        Ok(())
    }

    /// Records up to the most recently grabbed frame and waits for the
    /// files to be written. Frames still in processing keep flowing to
    /// the recorder until that frame has been added.
    pub fn stop_recording(&self) -> Result<()> {
        self.finish_recording(self.last_frame_number())
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.load().is_some()
    }

    /// Adds a note to the event file of the current recording
    pub fn record_event(&self, message: &str, data: Option<String>) -> bool {
        let frame_number = self.last_frame_number().unwrap_or(0);
        match &*self.recorder.load() {
            Some(recorder) => recorder.try_record_event(message, frame_number, data),
            None => false,
        }
    }

    pub fn start_calibration(&self) -> Result<()> {
        if !self.is_running() {
            return Err(TrackerError::NotRunning("eye tracker"));
        }
        if self.calibrating.load().is_some() {
            return Err(TrackerError::AlreadyStarted("calibration"));
        }
        let session = CalibrationSession::start(self.config.recording.buffer_size)?;
        self.calibrating.store(Some(Arc::new(session)));
        Ok(())
    }

    /// Turns the samples collected up to the most recently grabbed frame
    /// into the live calibration
    pub fn finish_calibration(&self) -> Result<CalibrationParameters> {
        let current = self.calibrating.load_full();
        let Some(session) = current.as_ref() else {
            return Err(TrackerError::NotRunning("calibration"));
        };
        // Stays installed until drained so in-flight results still reach it
        let last = self.last_frame_number();
        let finished = session.finish(last, self.stop_timeout(), &self.calibration.load());
        self.calibrating.compare_and_swap(&current, None);
        let updated = finished?;
        self.set_calibration(updated.clone());
        Ok(updated)
    }

    pub fn calibration(&self) -> Arc<CalibrationParameters> {
        self.calibration.load_full()
    }

    pub fn set_calibration(&self, calibration: CalibrationParameters) {
        if let Some(session) = &*self.session.lock() {
            session.dispatcher.set_calibration(calibration.clone());
        }
        self.calibration.store(Arc::new(calibration));
    }

    /// Takes effect on the next processed frame set
    pub fn update_settings(&self, settings: PipelineSettings) {
        self.settings.store(Arc::new(settings));
    }

    pub fn preview(&self) -> Arc<PreviewRing> {
        self.preview.clone()
    }

    pub fn center(&self, eye: Eye, point: (u32, u32)) -> bool {
        self.session.lock().as_ref().is_some_and(|s| s.grabber.center(eye, point))
    }

    pub fn move_roi(&self, eye: Eye, direction: Direction) -> bool {
        self.session.lock().as_ref().is_some_and(|s| s.grabber.move_roi(eye, direction))
    }

    pub fn status(&self) -> TrackerStatus {
        self.status_of(self.session.lock().as_ref())
    }

    fn status_of(&self, session: Option<&Session>) -> TrackerStatus {
        let mut status = TrackerStatus {
            running: session.is_some(),
            recording: self.is_recording(),
            calibrating: self.calibrating.load().is_some(),
            ..TrackerStatus::default()
        };
        if let Some(session) = session {
            let grab = session.grabber.stats();
            let processing = session.dispatcher.stats();
            status.grabbed = grab.grabbed.get();
            status.dropped = grab.dropped.get();
            status.frame_rate = grab.frame_rate();
            status.processed = processing.processed.get();
            status.not_processed = processing.not_processed.get();
            status.eye_failures = processing.eye_failures.get();
            status.buffer_depth = session.dispatcher.buffer_depth();
            status.buffer_capacity = session.dispatcher.buffer_capacity();
        }
        status
    }

    fn open_sources(&self) -> Result<EyeCollection<Box<dyn FrameSource>>> {
        let mut sources = EyeCollection::default();
        let capture = &self.config.capture;
        for (eye, config) in [(Eye::Left, &capture.left), (Eye::Right, &capture.right)] {
            if let Some(config) = config {
                sources.set(eye, self.sources.create(eye, config)?);
            }
        }
        Ok(sources)
    }

    /// Stops the recorder at frame `last`, or at once when `None`. It stays
    /// installed while draining so in-flight frames still reach it.
    fn finish_recording(&self, last: Option<u64>) -> Result<()> {
        let current = self.recorder.load_full();
        let Some(recorder) = current.as_ref() else {
            return Ok(());
        };
        let stopped = recorder.stop(last, self.stop_timeout());
        self.recorder.compare_and_swap(&current, None);
        stopped
    }

    /// Most recently grabbed frame, `None` without a running session
    fn last_frame_number(&self) -> Option<u64> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.grabber.stats().last_frame_number.get())
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.config.recording.stop_timeout_ms)
    }
}

impl Drop for EyeTracker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "Tracking stopped with errors");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, ScriptedSource};
    use crate::pipeline::{EyeAlgorithm, EyeData, EyeProcessingOutput, PupilData};
    use crate::SourceConfig;

    fn scripted_registry(frames: u64) -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        registry.register("scripted", move |eye, _config: &SourceConfig| {
            Ok(Box::new(ScriptedSource::new(eye, 1..=frames)) as Box<dyn FrameSource>)
        });
        registry
    }

    fn config(mode: crate::ProcessingMode) -> Config {
        let source = SourceConfig {
            kind: "scripted".into(),
            ..SourceConfig::default()
        };
        let mut config = Config::default();
        config.capture.left = Some(source.clone());
        config.capture.right = Some(source);
        config.processing.mode = mode;
        config.processing.pipeline.name = "null".into();
        config
    }

    fn wait_finished(tracker: &EyeTracker) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !tracker.is_finished() {
            assert!(Instant::now() < deadline, "tracker did not finish");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Finds the same pupil on every frame, slower than the cameras deliver
    struct Sluggish;

    impl EyeAlgorithm for Sluggish {
        fn process(
            &mut self,
            frame: &Frame,
            _calibration: &CalibrationParameters,
            _settings: &PipelineSettings,
        ) -> Result<EyeProcessingOutput> {
            std::thread::sleep(Duration::from_millis(15));
            let mut data = EyeData::empty(frame.eye(), frame.frame_number(), frame.meta.seconds);
            data.pupil = Some(PupilData {
                center: (4.0, 3.0),
                radius: 2.0,
                area: 12,
            });
            Ok(EyeProcessingOutput {
                data,
                torsion_image: None,
            })
        }
    }

    /// Endless paced sources feeding the sluggish pipeline
    fn sluggish_tracker(mode: crate::ProcessingMode) -> EyeTracker {
        let mut sources = SourceRegistry::new();
        sources.register("scripted", |eye, _config: &SourceConfig| {
            let source = ScriptedSource::new(eye, 1..=1_000_000)
                .with_interval(Duration::from_millis(5));
            Ok(Box::new(source) as Box<dyn FrameSource>)
        });
        let mut algorithms = AlgorithmRegistry::new();
        algorithms.register("sluggish", || Box::new(Sluggish));

        let mut config = config(mode);
        config.processing.pipeline.name = "sluggish".into();
        config.recording.stop_timeout_ms = 5000;
        EyeTracker::with_registries(config, sources, algorithms)
    }

    fn timed<T>(action: impl FnOnce() -> T) -> (T, Duration) {
        let started = Instant::now();
        let value = action();
        (value, started.elapsed())
    }

    #[test]
    fn test_offline_session_processes_every_frame() {
        let tracker = EyeTracker::with_registries(
            config(crate::ProcessingMode::Offline),
            scripted_registry(40),
            AlgorithmRegistry::with_defaults(),
        );
        tracker.start().unwrap();
        wait_finished(&tracker);
        tracker.stop().unwrap();

        let status = tracker.status();
        assert!(!status.running);
        let preview = tracker.preview();
        assert_eq!(preview.latest().unwrap().frame_number(), 40);
    }

    #[test]
    fn test_unknown_pipeline_fails_before_starting() {
        let mut config = config(crate::ProcessingMode::RealTime);
        config.processing.pipeline.name = "starburst".into();
        let tracker = EyeTracker::with_registries(
            config,
            scripted_registry(1),
            AlgorithmRegistry::with_defaults(),
        );
        assert!(matches!(tracker.start(), Err(TrackerError::UnknownPipeline(_))));
        assert!(!tracker.is_running());
    }

    #[test]
    fn test_commands_need_a_running_session() {
        let tracker = EyeTracker::with_registries(
            config(crate::ProcessingMode::RealTime),
            scripted_registry(1),
            AlgorithmRegistry::with_defaults(),
        );
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(tracker.start_recording(dir.path()), Err(TrackerError::NotRunning(_))));
        assert!(matches!(tracker.start_calibration(), Err(TrackerError::NotRunning(_))));
        assert!(!tracker.record_event("blink", None));
        assert!(!tracker.center(Eye::Left, (1, 1)));
        tracker.stop().unwrap();
    }

    #[test]
    fn test_real_time_stops_do_not_wait_out_the_timeout() {
        let tracker = sluggish_tracker(crate::ProcessingMode::RealTime);
        let dir = tempfile::tempdir().unwrap();
        tracker.start().unwrap();
        tracker.start_recording(dir.path()).unwrap();
        tracker.start_calibration().unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let recorder = tracker.recorder.load_full().unwrap();
        let (stopped, elapsed) = timed(|| tracker.stop_recording());
        stopped.unwrap();
        assert!(elapsed < Duration::from_secs(2), "recording took {elapsed:?} to stop");
        assert!(!tracker.is_recording());

        // Images come straight from the grabber, so they end at the last frame
        let last = recorder.images_stats().last_item().unwrap();
        let data = recorder.data_stats().last_item().unwrap();
        assert!(data <= last);
        assert!(data == last || tracker.status().not_processed > 0);

        let (finished, elapsed) = timed(|| tracker.finish_calibration());
        let calibration = finished.unwrap();
        assert!(elapsed < Duration::from_secs(2), "calibration took {elapsed:?} to finish");
        assert_eq!(calibration.left_reference, Some((4.0, 3.0)));
        assert_eq!(tracker.calibration().right_reference, Some((4.0, 3.0)));

        let dir = tempfile::tempdir().unwrap();
        tracker.start_recording(dir.path()).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let (stopped, elapsed) = timed(|| tracker.stop());
        stopped.unwrap();
        assert!(elapsed < Duration::from_secs(2), "tracker took {elapsed:?} to stop");
        assert!(!tracker.is_recording());
    }

    #[test]
    fn test_offline_recording_ends_exactly_at_the_designated_frame() {
        let tracker = sluggish_tracker(crate::ProcessingMode::Offline);
        let dir = tempfile::tempdir().unwrap();
        tracker.start().unwrap();
        tracker.start_recording(dir.path()).unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let recorder = tracker.recorder.load_full().unwrap();
        let last = tracker.last_frame_number().unwrap();
        let (stopped, elapsed) = timed(|| tracker.finish_recording(Some(last)));
        stopped.unwrap();
        assert!(elapsed < Duration::from_secs(2), "recording took {elapsed:?} to stop");
        assert_eq!(recorder.data_stats().last_item(), Some(last));
        assert_eq!(recorder.images_stats().last_item(), Some(last));
        assert_eq!(recorder.data_stats().dropped.get(), 0);
        tracker.stop().unwrap();
    }
}
