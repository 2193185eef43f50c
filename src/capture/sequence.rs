//! Directory of still images played back as a video

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{info, instrument, warn};

use super::frame::{Eye, Frame, FrameMetadata, PixelFormat};
use super::source::{FrameSource, Grab, SourceMode};
use crate::error::{Result, TrackerError};
use crate::SourceConfig;

const EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Plays a sorted directory of PNG/JPEG files as a grayscale video.
///
/// Frame numbers are contiguous starting at 1 and timestamps follow the
/// configured frame rate. With `realtime` set, grabs are paced at that
/// rate; otherwise frames come as fast as the consumer pulls them.
pub struct ImageSequenceSource {
    name: String,
    eye: Eye,
    files: Vec<PathBuf>,
    position: usize,
    fps: f64,
    realtime: bool,
    frame_size: (u32, u32),
    started_at: Option<Instant>,
}

impl ImageSequenceSource {
    #[instrument(skip(config), fields(path = %config.path))]
    pub fn open(eye: Eye, config: &SourceConfig) -> Result<Self> {
        let name = format!("sequence-{}", eye.label());
        let files = list_images(Path::new(&config.path))?;
        let first = files.first().ok_or_else(|| {
            TrackerError::from_source(&name, format!("no images in {}", config.path))
        })?;
        let (width, height) = image::image_dimensions(first)?;
        info!(source = %name, frames = files.len(), width, height, "Image sequence opened");

        Ok(Self {
            name,
            eye,
            files,
            position: 0,
            fps: if config.fps > 0.0 { config.fps } else { 30.0 },
            realtime: config.realtime,
            frame_size: (width, height),
            started_at: None,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    files.sort();
    Ok(files)
}

impl FrameSource for ImageSequenceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn eye(&self) -> Eye {
        self.eye
    }

    fn start(&mut self) -> Result<()> {
        self.position = 0;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    fn grab_next(&mut self) -> Result<Grab> {
        let Some(started_at) = self.started_at else {
            return Err(TrackerError::from_source(&self.name, "grab before start"));
        };
        let Some(path) = self.files.get(self.position) else {
            return Ok(Grab::EndOfStream);
        };
        let frame_number = self.position as u64 + 1;
        let offset = frame_number as f64 / self.fps;

        if self.realtime {
            let due = started_at + Duration::from_secs_f64(offset);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }

        let image = image::open(path)?.to_luma8();
        self.position += 1;
        if image.dimensions() != self.frame_size {
            warn!(
                source = %self.name,
                path = %path.display(),
                "Image size differs from the first frame, skipping"
            );
            return Ok(Grab::Timeout);
        }

        let (width, height) = image.dimensions();
        Ok(Grab::Frame(Frame {
            data: Bytes::from(image.into_raw()),
            meta: Arc::new(FrameMetadata {
                eye: self.eye,
                frame_number,
                hardware_frame_number: frame_number,
                width,
                height,
                stride: width,
                format: PixelFormat::Gray8,
                seconds: offset,
            }),
            timestamp: Instant::now(),
        }))
    }

    fn stop(&mut self) -> Result<()> {
        self.started_at = None;
        Ok(())
    }

    fn frame_rate(&self) -> f64 {
        self.fps
    }

    fn frame_size(&self) -> (u32, u32) {
        self.frame_size
    }

    fn mode(&self) -> SourceMode {
        SourceMode::Video
    }
}
