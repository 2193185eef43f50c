pub mod capture;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod status;
pub mod tasks;
pub mod tracker;
pub mod utils;

use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use serde::{Deserialize, Serialize};

pub use capture::{Eye, EyeCollection, Frame, FrameSet};
pub use error::{Result, TrackerError};
pub use pipeline::{ProcessedResult, ProcessingMode};
pub use session::ImageRecording;
pub use status::TrackerStatus;
pub use tracker::EyeTracker;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Tracker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub processing: ProcessingConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub left: Option<SourceConfig>,
    pub right: Option<SourceConfig>,
    /// Pin camera threads to their own CPU cores
    pub pin_grab_threads: bool,
    /// Frames kept per camera while waiting for the other one
    pub sync_queue_limit: usize,
}

/// One eye camera or video
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Registry key: `synthetic`, `image-sequence` or `v4l2`
    pub kind: String,
    /// Device node or image directory
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub format: PixelFormat,
    pub buffer_count: u32,
    /// Stop after this many frames
    pub frame_count: Option<u64>,
    /// Simulate a hardware drop every n-th frame
    pub drop_every: Option<u64>,
    /// Pace file playback at `fps`
    pub realtime: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub mode: ProcessingMode,
    /// Upper bound on processing workers; one core is always left for grabbing
    pub max_workers: usize,
    pub buffer_size: usize,
    pub pipeline: PipelineSettings,
}

/// Per-eye pipeline selection and tuning, read by workers on every frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub name: String,
    /// Luminance below which a pixel counts as pupil
    pub pupil_threshold: u8,
    pub min_pupil_pixels: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
    pub buffer_size: usize,
    pub images: ImageRecording,
    /// How long to wait for the last frame when recording stops
    pub stop_timeout_ms: u64,
    /// Results kept for UI previews
    pub preview_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            left: Some(SourceConfig::default()),
            right: Some(SourceConfig::default()),
            pin_grab_threads: false,
            sync_queue_limit: 100,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: "synthetic".into(),
            path: String::new(),
            width: 320,
            height: 240,
            fps: 100.0,
            format: PixelFormat::Gray8,
            buffer_count: 4,
            frame_count: None,
            drop_every: None,
            realtime: true,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::RealTime,
            max_workers: 4,
            buffer_size: 16,
            pipeline: PipelineSettings::default(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            name: pipeline::DarkPupil::NAME.into(),
            pupil_threshold: 40,
            min_pupil_pixels: 20,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recordings"),
            buffer_size: 256,
            images: ImageRecording::Grabbed,
            stop_timeout_ms: 2000,
            preview_size: 8,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file when given, then `BINOC__SECTION__KEY`
    /// environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                ::config::Environment::with_prefix("BINOC")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
