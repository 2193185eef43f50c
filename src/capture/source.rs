//! Frame source capability and the registry that builds sources by kind

use std::collections::HashMap;
use std::sync::Arc;

use super::frame::{Eye, Frame};
use crate::error::{Result, TrackerError};
use crate::SourceConfig;

/// Outcome of a single grab call
#[derive(Debug)]
pub enum Grab {
    Frame(Frame),
    /// Nothing arrived within the source's own timeout; try again
    Timeout,
    /// The source will never produce another frame (end of a video)
    EndOfStream,
}

/// Cameras number frames from the hardware and may drop; videos are
/// contiguous by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Camera,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

/// Sources whose region of interest can be repositioned while running
pub trait MovableSource {
    fn center(&mut self, point: (u32, u32));
    fn move_by(&mut self, direction: Direction);
}

/// A camera or a video yielding one time-stamped image per call.
///
/// `grab_next` may block up to the source's internal timeout. An `Err`
/// is fatal for the source (disconnected camera, unreadable file);
/// transient glitches are reported as `Grab::Timeout`.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    fn eye(&self) -> Eye;

    fn start(&mut self) -> Result<()>;

    fn grab_next(&mut self) -> Result<Grab>;

    fn stop(&mut self) -> Result<()>;

    fn frame_rate(&self) -> f64;

    fn frame_size(&self) -> (u32, u32);

    fn mode(&self) -> SourceMode {
        SourceMode::Camera
    }

    fn as_movable(&mut self) -> Option<&mut dyn MovableSource> {
        None
    }
}

pub type SourceFactory =
    Arc<dyn Fn(Eye, &SourceConfig) -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// Maps a source kind (`synthetic`, `image-sequence`, ...) to a factory
#[derive(Clone, Default)]
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every source kind compiled into this build
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("synthetic", |eye, config| {
            let source = super::synthetic::SyntheticSource::new(eye, config);
            Ok(Box::new(source) as Box<dyn FrameSource>)
        });
        registry.register("image-sequence", |eye, config| {
            let source = super::sequence::ImageSequenceSource::open(eye, config)?;
            Ok(Box::new(source) as Box<dyn FrameSource>)
        });
        #[cfg(feature = "v4l2")]
        registry.register("v4l2", |eye, config| {
            Ok(Box::new(super::v4l2::V4l2Source::new(eye, config.clone())?) as Box<dyn FrameSource>)
        });
        registry
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(Eye, &SourceConfig) -> Result<Box<dyn FrameSource>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn create(&self, eye: Eye, config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| TrackerError::UnknownSource(config.kind.clone()))?;
        factory(eye, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_builds_synthetic() {
        let registry = SourceRegistry::with_defaults();
        assert!(registry.kinds().contains(&"synthetic"));

        let config = SourceConfig::default();
        let source = registry.create(Eye::Right, &config).unwrap();
        assert_eq!(source.eye(), Eye::Right);
        assert_eq!(source.frame_size(), (config.width, config.height));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let registry = SourceRegistry::with_defaults();
        let config = SourceConfig {
            kind: "flycapture".into(),
            ..SourceConfig::default()
        };
        let err = registry.create(Eye::Left, &config).err().unwrap();
        assert!(matches!(err, TrackerError::UnknownSource(kind) if kind == "flycapture"));
    }
}
