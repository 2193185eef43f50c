pub mod algorithm;
pub mod consumer;
pub mod data;
pub mod dispatcher;
pub mod left_right;
pub mod ringbuf;

pub use algorithm::{AlgorithmRegistry, DarkPupil, EyeAlgorithm, HeadSensor, NullAlgorithm};
pub use consumer::{BoundedConsumer, ConsumerSink, ConsumerStats, FnSink};
pub use data::{
    CalibratedGaze, CalibrationParameters, EyeData, EyeProcessingOutput, HeadData, ProcessedResult,
    PupilData,
};
pub use dispatcher::{
    DispatcherOptions, DispatcherStats, FrameDispatcher, ProcessingMode, ResultCallback,
};
pub use left_right::LeftRightProcessor;
pub use ringbuf::PreviewRing;
