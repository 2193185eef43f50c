//! Downstream consumers of a tracking session

pub mod calibration;
pub mod recorder;

pub use calibration::CalibrationSession;
pub use recorder::{EventRecord, ImageRecording, Recorder, RecorderOptions};
