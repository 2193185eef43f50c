use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use binoc::capture::{
    Eye, EyeCollection, Frame, FrameSet, FrameSource, GrabberOptions, ImageGrabber, ScriptedSource,
};
use binoc::pipeline::{
    AlgorithmRegistry, CalibrationParameters, DispatcherOptions, EyeAlgorithm, EyeData,
    EyeProcessingOutput, FrameDispatcher, ProcessedResult, ProcessingMode,
};
use binoc::{PipelineSettings, Result};
use parking_lot::Mutex;

/// Takes a frame-dependent amount of time so workers finish out of order
struct Uneven;

impl EyeAlgorithm for Uneven {
    fn process(
        &mut self,
        frame: &Frame,
        _calibration: &CalibrationParameters,
        _settings: &PipelineSettings,
    ) -> Result<EyeProcessingOutput> {
        thread::sleep(Duration::from_micros(300 * (frame.frame_number() % 7)));
        Ok(EyeProcessingOutput {
            data: EyeData::empty(frame.eye(), frame.frame_number(), frame.meta.seconds),
            torsion_image: None,
        })
    }
}

fn dispatcher(workers: usize, buffer_size: usize, mode: ProcessingMode) -> Arc<FrameDispatcher> {
    let mut registry = AlgorithmRegistry::new();
    registry.register("uneven", || Box::new(Uneven));
    let settings = PipelineSettings {
        name: "uneven".into(),
        ..PipelineSettings::default()
    };
    Arc::new(FrameDispatcher::new(
        DispatcherOptions {
            workers,
            buffer_size,
            mode,
        },
        Arc::new(registry),
        Arc::new(ArcSwap::from_pointee(settings)),
    ))
}

fn source(eye: Eye) -> Box<dyn FrameSource> {
    Box::new(ScriptedSource::new(eye, 1..=100).with_interval(Duration::from_millis(1)))
}

fn scripted(eye: Eye) -> Box<dyn FrameSource> {
    Box::new(ScriptedSource::new(eye, 1..=200))
}

#[test]
fn stop_mid_stream_accounts_for_every_enqueued_frame_set() {
    let grabber = ImageGrabber::new(
        EyeCollection::new(Some(source(Eye::Left)), Some(source(Eye::Right))),
        GrabberOptions::default(),
    )
    .unwrap();
    let dispatcher = dispatcher(4, 8, ProcessingMode::RealTime);

    let emitted = Arc::new(Mutex::new(Vec::new()));
    let sink = emitted.clone();
    dispatcher
        .start(Box::new(move |result: ProcessedResult| {
            sink.lock().push((result.sequence, result.frame_number()))
        }))
        .unwrap();
    let input = dispatcher.clone();
    grabber
        .start(Box::new(move |frames: FrameSet| {
            input.try_process_images(frames);
        }))
        .unwrap();

    let stats = grabber.stats();
    let deadline = Instant::now() + Duration::from_secs(10);
    while stats.last_frame_number.get() < 60 {
        assert!(Instant::now() < deadline, "grabber stalled");
        thread::sleep(Duration::from_millis(1));
    }
    grabber.stop().unwrap();
    dispatcher.stop().unwrap();

    let processing = dispatcher.stats();
    let emitted = emitted.lock();
    assert_eq!(processing.submitted.get(), stats.grabbed.get());
    assert_eq!(emitted.len() as u64, processing.processed.get());
    assert_eq!(
        processing.processed.get() + processing.not_processed.get(),
        processing.submitted.get()
    );
    assert!(emitted.windows(2).all(|w| w[0].0 + 1 == w[1].0 && w[0].1 < w[1].1));
}

#[test]
fn offline_mode_never_drops() {
    let grabber = ImageGrabber::new(
        EyeCollection::single(Eye::Left, scripted(Eye::Left)),
        GrabberOptions::default(),
    )
    .unwrap();
    let dispatcher = dispatcher(3, 2, ProcessingMode::Offline);

    let emitted = Arc::new(Mutex::new(Vec::new()));
    let sink = emitted.clone();
    dispatcher
        .start(Box::new(move |result: ProcessedResult| sink.lock().push(result.frame_number())))
        .unwrap();
    let input = dispatcher.clone();
    grabber
        .start(Box::new(move |frames: FrameSet| {
            assert!(input.try_process_images(frames));
        }))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    while !grabber.is_finished() {
        assert!(Instant::now() < deadline, "grabber did not finish");
        thread::sleep(Duration::from_millis(5));
    }
    grabber.stop().unwrap();
    dispatcher.stop().unwrap();

    assert_eq!(*emitted.lock(), (1..=200).collect::<Vec<u64>>());
    assert_eq!(dispatcher.stats().not_processed.get(), 0);
}
