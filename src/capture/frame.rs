use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Which eye a camera or image belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Eye {
    Left,
    Right,
}

impl Eye {
    pub const ALL: [Eye; 2] = [Eye::Left, Eye::Right];

    pub fn index(self) -> usize {
        match self {
            Eye::Left => 0,
            Eye::Right => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Eye::Left => "left",
            Eye::Right => "right",
        }
    }
}

/// One value per eye, either of which may be missing
#[derive(Debug, Clone, PartialEq)]
pub struct EyeCollection<T> {
    pub left: Option<T>,
    pub right: Option<T>,
}

impl<T> Default for EyeCollection<T> {
    fn default() -> Self {
        Self {
            left: None,
            right: None,
        }
    }
}

impl<T> EyeCollection<T> {
    pub fn new(left: Option<T>, right: Option<T>) -> Self {
        Self { left, right }
    }

    pub fn single(eye: Eye, value: T) -> Self {
        let mut collection = Self::default();
        collection.set(eye, value);
        collection
    }

    pub fn get(&self, eye: Eye) -> Option<&T> {
        match eye {
            Eye::Left => self.left.as_ref(),
            Eye::Right => self.right.as_ref(),
        }
    }

    pub fn get_mut(&mut self, eye: Eye) -> Option<&mut T> {
        match eye {
            Eye::Left => self.left.as_mut(),
            Eye::Right => self.right.as_mut(),
        }
    }

    pub fn set(&mut self, eye: Eye, value: T) {
        match eye {
            Eye::Left => self.left = Some(value),
            Eye::Right => self.right = Some(value),
        }
    }

    pub fn take(&mut self, eye: Eye) -> Option<T> {
        match eye {
            Eye::Left => self.left.take(),
            Eye::Right => self.right.take(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Eye, &T)> {
        Eye::ALL
            .into_iter()
            .filter_map(move |eye| self.get(eye).map(|value| (eye, value)))
    }

    pub fn into_entries(self) -> impl Iterator<Item = (Eye, T)> {
        [(Eye::Left, self.left), (Eye::Right, self.right)]
            .into_iter()
            .filter_map(|(eye, value)| value.map(|value| (eye, value)))
    }

    pub fn eyes(&self) -> Vec<Eye> {
        self.iter().map(|(eye, _)| eye).collect()
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    pub fn map<U>(self, mut f: impl FnMut(Eye, T) -> U) -> EyeCollection<U> {
        EyeCollection {
            left: self.left.map(|value| f(Eye::Left, value)),
            right: self.right.map(|value| f(Eye::Right, value)),
        }
    }
}

/// One captured image for one eye. Pixel data is immutable and can be
/// shared across threads without copying.
#[derive(Clone)]
pub struct Frame {
    pub data: Bytes,

    pub meta: Arc<FrameMetadata>,

    /// Local capture instant for latency tracking
    pub timestamp: Instant,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("eye", &self.meta.eye)
            .field("frame_number", &self.meta.frame_number)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Frame {
    pub fn eye(&self) -> Eye {
        self.meta.eye
    }

    pub fn frame_number(&self) -> u64 {
        self.meta.frame_number
    }
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub eye: Eye,
    /// Monotonic per source, may have gaps when the camera drops frames
    pub frame_number: u64,
    pub hardware_frame_number: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    /// Capture time in seconds, correlated with wall-clock time
    pub seconds: f64,
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Yuyv4,
    Mjpeg,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Rgb24 => Some(3),
            PixelFormat::Yuyv4 => Some(2),
            PixelFormat::Mjpeg => None,
        }
    }
}

/// Left/right frames captured for the same logical instant.
///
/// Once past synchronization every present frame carries `frame_number`.
#[derive(Debug, Clone)]
pub struct FrameSet {
    pub frames: EyeCollection<Frame>,
    pub frame_number: u64,
    pub seconds: f64,
}

impl FrameSet {
    pub fn new(frames: EyeCollection<Frame>, frame_number: u64) -> Self {
        let seconds = frames
            .iter()
            .map(|(_, frame)| frame.meta.seconds)
            .fold(f64::NAN, f64::min);
        Self {
            frames,
            frame_number,
            seconds: if seconds.is_nan() { 0.0 } else { seconds },
        }
    }

    pub fn single(frame: Frame) -> Self {
        let frame_number = frame.frame_number();
        Self::new(EyeCollection::single(frame.eye(), frame), frame_number)
    }

    pub fn get(&self, eye: Eye) -> Option<&Frame> {
        self.frames.get(eye)
    }
}
