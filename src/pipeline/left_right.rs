//! Fan-out/fan-in barrier running both eyes of a frame set concurrently

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, warn};

use super::algorithm::{AlgorithmRegistry, EyeAlgorithm};
use super::data::{CalibrationParameters, EyeProcessingOutput};
use crate::capture::{Eye, EyeCollection, Frame, FrameSet};
use crate::error::{Result, TrackerError};
use crate::status::Counter;
use crate::PipelineSettings;

struct EyeJob {
    frame: Frame,
    settings: Arc<PipelineSettings>,
    calibration: Arc<CalibrationParameters>,
}

/// One persistent eye thread with its own work and done signals
struct EyeWorker {
    jobs: Option<Sender<EyeJob>>,
    done: Receiver<Option<EyeProcessingOutput>>,
    handle: Option<JoinHandle<()>>,
}

/// Runs the left and right algorithm on two dedicated threads and waits
/// for both.
///
/// Each eye thread builds and caches its own algorithm instance, so the
/// instance is only ever called from that thread. A failure inside one
/// eye is logged and counted and yields no result for that eye; the
/// barrier still completes.
pub struct LeftRightProcessor {
    name: String,
    workers: Vec<EyeWorker>,
}

impl LeftRightProcessor {
    pub fn new(
        name: impl Into<String>,
        registry: Arc<AlgorithmRegistry>,
        failures: Arc<Counter>,
    ) -> Result<Self> {
        let name = name.into();
        let mut workers = Vec::with_capacity(Eye::ALL.len());
        for eye in Eye::ALL {
            let (job_tx, job_rx) = channel::bounded(1);
            let (done_tx, done_rx) = channel::bounded(1);
            let registry = registry.clone();
            let failures = failures.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{}", eye.label()))
                .spawn(move || run_eye(eye, registry, failures, job_rx, done_tx))?;
            workers.push(EyeWorker {
                jobs: Some(job_tx),
                done: done_rx,
                handle: Some(handle),
            });
        }
        Ok(Self { name, workers })
    }

    /// Processes every present eye of `frames` and returns once all of
    /// them are done. Absent eyes are neither signalled nor waited on.
    pub fn process_images(
        &mut self,
        frames: &FrameSet,
        settings: &Arc<PipelineSettings>,
        calibration: &Arc<CalibrationParameters>,
    ) -> Result<EyeCollection<EyeProcessingOutput>> {
        let eyes = frames.frames.eyes();
        for (eye, frame) in frames.frames.iter() {
            let job = EyeJob {
                frame: frame.clone(),
                settings: settings.clone(),
                calibration: calibration.clone(),
            };
            let sent = self.workers[eye.index()]
                .jobs
                .as_ref()
                .is_some_and(|jobs| jobs.send(job).is_ok());
            if !sent {
                return Err(self.stopped(eye));
            }
        }

        let mut outputs = EyeCollection::default();
        for eye in eyes {
            match self.workers[eye.index()].done.recv() {
                Ok(Some(output)) => outputs.set(eye, output),
                Ok(None) => {}
                Err(_) => return Err(self.stopped(eye)),
            }
        }
        Ok(outputs)
    }

    /// Closes both work signals and waits for the eye threads to exit.
    /// Calling it again is a no-op.
    pub fn stop(&mut self) {
        for worker in &mut self.workers {
            worker.jobs.take();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                if handle.join().is_err() {
                    warn!(processor = %self.name, "Eye thread panicked");
                }
            }
        }
    }

    fn stopped(&self, eye: Eye) -> TrackerError {
        TrackerError::WorkerStopped(format!("{}-{}", self.name, eye.label()))
    }
}

impl Drop for LeftRightProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_eye(
    eye: Eye,
    registry: Arc<AlgorithmRegistry>,
    failures: Arc<Counter>,
    jobs: Receiver<EyeJob>,
    done: Sender<Option<EyeProcessingOutput>>,
) {
    let mut cached: Option<(String, Box<dyn EyeAlgorithm>)> = None;
    while let Ok(job) = jobs.recv() {
        let output = process_eye(eye, &registry, &mut cached, &job);
        if output.is_none() {
            failures.inc();
            metrics::counter!("binoc_eye_failures_total", "eye" => eye.label()).increment(1);
        }
        if done.send(output).is_err() {
            break;
        }
    }
    debug!(eye = eye.label(), "Eye thread exiting");
}

/// Runs one job on the cached instance, rebuilding it when the pipeline
/// name changed. `None` when the eye failed.
fn process_eye(
    eye: Eye,
    registry: &AlgorithmRegistry,
    cached: &mut Option<(String, Box<dyn EyeAlgorithm>)>,
    job: &EyeJob,
) -> Option<EyeProcessingOutput> {
    let wanted = job.settings.name.as_str();
    if cached.as_ref().map_or(true, |(name, _)| name != wanted) {
        match registry.create(wanted) {
            Ok(algorithm) => {
                debug!(eye = eye.label(), pipeline = wanted, "Built eye pipeline");
                *cached = Some((wanted.to_string(), algorithm));
            }
            Err(err) => {
                warn!(eye = eye.label(), error = %err, "Cannot build eye pipeline");
                *cached = None;
                return None;
            }
        }
    }
    let (_, algorithm) = cached.as_mut()?;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        algorithm.process(&job.frame, &job.calibration, &job.settings)
    }));
    match outcome {
        Ok(Ok(output)) => Some(output),
        Ok(Err(err)) => {
            warn!(
                eye = eye.label(),
                frame = job.frame.frame_number(),
                error = %err,
                "Eye processing failed"
            );
            None
        }
        Err(_) => {
            warn!(
                eye = eye.label(),
                frame = job.frame.frame_number(),
                "Eye algorithm panicked, rebuilding"
            );
            *cached = None;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::tests::gray_frame;
    use crate::pipeline::data::EyeData;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    struct Echo;

    impl EyeAlgorithm for Echo {
        fn process(
            &mut self,
            frame: &Frame,
            _calibration: &CalibrationParameters,
            _settings: &PipelineSettings,
        ) -> Result<EyeProcessingOutput> {
            Ok(EyeProcessingOutput {
                data: EyeData::empty(frame.eye(), frame.frame_number(), frame.meta.seconds),
                torsion_image: None,
            })
        }
    }

    /// Fails on the left eye, panics on frame 13
    struct Flaky;

    impl EyeAlgorithm for Flaky {
        fn process(
            &mut self,
            frame: &Frame,
            calibration: &CalibrationParameters,
            settings: &PipelineSettings,
        ) -> Result<EyeProcessingOutput> {
            if frame.frame_number() == 13 {
                panic!("corrupt image");
            }
            if frame.eye() == Eye::Left {
                return Err(TrackerError::Processing {
                    eye: Eye::Left,
                    message: "no pupil".into(),
                });
            }
            Echo.process(frame, calibration, settings)
        }
    }

    struct Rendezvous(Arc<Barrier>);

    impl EyeAlgorithm for Rendezvous {
        fn process(
            &mut self,
            frame: &Frame,
            calibration: &CalibrationParameters,
            settings: &PipelineSettings,
        ) -> Result<EyeProcessingOutput> {
            // Only returns when the other eye is running at the same time
            self.0.wait();
            Echo.process(frame, calibration, settings)
        }
    }

    fn settings(name: &str) -> Arc<PipelineSettings> {
        Arc::new(PipelineSettings {
            name: name.to_string(),
            ..PipelineSettings::default()
        })
    }

    fn pair(n: u64) -> FrameSet {
        FrameSet::new(
            EyeCollection::new(Some(gray_frame(Eye::Left, n)), Some(gray_frame(Eye::Right, n))),
            n,
        )
    }

    fn processor(registry: AlgorithmRegistry) -> (LeftRightProcessor, Arc<Counter>) {
        let failures = Arc::new(Counter::default());
        let processor =
            LeftRightProcessor::new("test", Arc::new(registry), failures.clone()).unwrap();
        (processor, failures)
    }

    #[test]
    fn test_single_eye_returns_without_other_eye() {
        let mut registry = AlgorithmRegistry::new();
        registry.register("echo", || Box::new(Echo));
        let (mut processor, _) = processor(registry);

        let frames = FrameSet::single(gray_frame(Eye::Right, 4));
        let outputs = processor
            .process_images(&frames, &settings("echo"), &Arc::default())
            .unwrap();
        assert!(outputs.left.is_none());
        assert_eq!(outputs.right.unwrap().data.frame_number, 4);
    }

    #[test]
    fn test_both_eyes_run_concurrently() {
        let barrier = Arc::new(Barrier::new(2));
        let mut registry = AlgorithmRegistry::new();
        registry.register("rendezvous", move || Box::new(Rendezvous(barrier.clone())));
        let (mut processor, _) = processor(registry);

        for n in 1..=3 {
            let outputs = processor
                .process_images(&pair(n), &settings("rendezvous"), &Arc::default())
                .unwrap();
            assert_eq!(outputs.count(), 2);
        }
    }

    #[test]
    fn test_eye_failures_are_swallowed_and_counted() {
        let mut registry = AlgorithmRegistry::new();
        registry.register("flaky", || Box::new(Flaky));
        let (mut processor, failures) = processor(registry);
        let settings = settings("flaky");

        let outputs = processor.process_images(&pair(1), &settings, &Arc::default()).unwrap();
        assert!(outputs.left.is_none());
        assert!(outputs.right.is_some());
        assert_eq!(failures.get(), 1);

        // Both eyes panic; the barrier still completes and the instances are rebuilt
        let outputs = processor.process_images(&pair(13), &settings, &Arc::default()).unwrap();
        assert!(outputs.is_empty());
        assert_eq!(failures.get(), 3);

        let outputs = processor.process_images(&pair(14), &settings, &Arc::default()).unwrap();
        assert_eq!(outputs.right.unwrap().data.frame_number, 14);
    }

    #[test]
    fn test_pipeline_rebuilt_only_on_name_change() {
        let built = Arc::new(AtomicUsize::new(0));
        let mut registry = AlgorithmRegistry::new();
        for name in ["a", "b"] {
            let built = built.clone();
            registry.register(name, move || {
                built.fetch_add(1, Ordering::SeqCst);
                Box::new(Echo)
            });
        }
        let (mut processor, _) = processor(registry);
        let frames = FrameSet::single(gray_frame(Eye::Left, 1));

        processor.process_images(&frames, &settings("a"), &Arc::default()).unwrap();
        processor.process_images(&frames, &settings("a"), &Arc::default()).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);

        processor.process_images(&frames, &settings("b"), &Arc::default()).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_pipeline_counts_as_failure() {
        let (mut processor, failures) = processor(AlgorithmRegistry::new());
        let outputs = processor
            .process_images(&pair(1), &settings("missing"), &Arc::default())
            .unwrap();
        assert!(outputs.is_empty());
        assert_eq!(failures.get(), 2);
    }

    #[test]
    fn test_stop_is_idempotent_and_rejects_work() {
        let (mut processor, _) = processor(AlgorithmRegistry::with_defaults());
        processor.stop();
        processor.stop();
        let result = processor.process_images(&pair(1), &settings("null"), &Arc::default());
        assert!(matches!(result, Err(TrackerError::WorkerStopped(_))));
    }
}
