//! V4L2 eye camera with memory-mapped streaming

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{Eye, Frame, FrameMetadata, PixelFormat};
use super::source::{FrameSource, Grab};
use crate::error::{Result, TrackerError};
use crate::SourceConfig;

/// One eye camera behind a V4L2 device node
pub struct V4l2Source {
    name: String,
    eye: Eye,
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    config: SourceConfig,
    first_sequence: Option<u32>,
}

impl V4l2Source {
    #[instrument(skip(config), fields(path = %config.path))]
    pub fn new(eye: Eye, config: SourceConfig) -> Result<Self> {
        let name = format!("v4l2-{}", eye.label());
        info!("Initializing V4L2 capture: {}", config.path);

        let device = Device::with_path(&config.path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(TrackerError::from_source(name, "device doesn't support video capture"));
        }

        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = match config.format {
            PixelFormat::Gray8 => FourCC::new(b"GREY"),
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        };
        let applied = device.set_format(&fmt)?;
        if applied.width != config.width || applied.height != config.height {
            return Err(TrackerError::from_source(
                name,
                format!(
                    "requested {}x{}, device negotiated {}x{}",
                    config.width, config.height, applied.width, applied.height
                ),
            ));
        }

        Ok(Self {
            name,
            eye,
            device: Box::new(device),
            stream: None,
            config,
            first_sequence: None,
        })
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.name
    }

    fn eye(&self) -> Eye {
        self.eye
    }

    fn start(&mut self) -> Result<()> {
        let stream =
            MmapStream::with_buffers(&self.device, Type::VideoCapture, self.config.buffer_count)?;
        self.stream = Some(stream);
        self.first_sequence = None;
        info!(
            "Capture stream started with {} buffers",
            self.config.buffer_count
        );
        Ok(())
    }

    fn grab_next(&mut self) -> Result<Grab> {
        let timestamp = Instant::now();

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TrackerError::from_source(&self.name, "stream not started"))?;

        let (buf, meta) = stream.next()?;
        if buf.is_empty() {
            return Ok(Grab::Timeout);
        }
        let data = Bytes::copy_from_slice(buf);

        let first = *self.first_sequence.get_or_insert(meta.sequence);
        let device_time = Duration::from_secs(meta.timestamp.sec as u64)
            + Duration::from_micros(meta.timestamp.usec as u64);
        let stride = self
            .config
            .format
            .bytes_per_pixel()
            .map_or(self.config.width, |bpp| self.config.width * bpp);

        Ok(Grab::Frame(Frame {
            data,
            meta: Arc::new(FrameMetadata {
                eye: self.eye,
                frame_number: u64::from(meta.sequence.wrapping_sub(first)) + 1,
                hardware_frame_number: u64::from(meta.sequence),
                width: self.config.width,
                height: self.config.height,
                stride,
                format: self.config.format,
                seconds: device_time.as_secs_f64(),
            }),
            timestamp,
        }))
    }

    fn stop(&mut self) -> Result<()> {
        if self.stream.take().is_some() {
            info!(source = %self.name, "Capture stream stopped");
        }
        Ok(())
    }

    fn frame_rate(&self) -> f64 {
        self.config.fps
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }
}
