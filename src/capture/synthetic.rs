//! Generated and scripted sources used for demos, benchmarks and tests

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{debug, info};

use super::frame::{Eye, Frame, FrameMetadata, PixelFormat};
use super::source::{Direction, FrameSource, Grab, MovableSource, SourceMode};
use crate::error::{Result, TrackerError};
use crate::SourceConfig;

const BACKGROUND: u8 = 190;
const PUPIL: u8 = 12;
const ROI_STEP: i32 = 4;

pub(crate) fn wall_clock_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Camera simulator drawing a dark pupil that circles the image center.
///
/// Frames are paced at the configured rate. With `drop_every = n` every
/// n-th hardware frame number is skipped, the way a camera that cannot
/// keep up would report it.
pub struct SyntheticSource {
    name: String,
    eye: Eye,
    config: SourceConfig,
    running: bool,
    hardware_counter: u64,
    emitted: u64,
    next_due: Option<Instant>,
    roi_offset: (i32, i32),
}

impl SyntheticSource {
    pub fn new(eye: Eye, config: &SourceConfig) -> Self {
        Self {
            name: format!("synthetic-{}", eye.label()),
            eye,
            config: config.clone(),
            running: false,
            hardware_counter: 0,
            emitted: 0,
            next_due: None,
            roi_offset: (0, 0),
        }
    }

    fn pupil_center(&self) -> (f64, f64) {
        let (w, h) = (self.config.width as f64, self.config.height as f64);
        let phase = self.hardware_counter as f64 / self.config.fps.max(1.0);
        let orbit = w.min(h) / 6.0;
        (
            w / 2.0 + orbit * phase.cos() - self.roi_offset.0 as f64,
            h / 2.0 + orbit * phase.sin() - self.roi_offset.1 as f64,
        )
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        let (cx, cy) = self.pupil_center();
        let radius = (w.min(h) as f64 / 10.0).max(1.0);
        let r2 = radius * radius;

        let mut pixels = vec![BACKGROUND; w * h];
        for (y, row) in pixels.chunks_exact_mut(w.max(1)).enumerate() {
            let dy = y as f64 - cy;
            if dy.abs() > radius {
                continue;
            }
            for (x, px) in row.iter_mut().enumerate() {
                let dx = x as f64 - cx;
                if dx * dx + dy * dy <= r2 {
                    *px = PUPIL;
                }
            }
        }
        pixels
    }

    fn wait_for_next_slot(&mut self) {
        if self.config.fps <= 0.0 {
            return;
        }
        let period = Duration::from_secs_f64(1.0 / self.config.fps);
        let due = *self.next_due.get_or_insert_with(Instant::now);
        let now = Instant::now();
        if due > now {
            thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + period);
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn eye(&self) -> Eye {
        self.eye
    }

    fn start(&mut self) -> Result<()> {
        info!(
            source = %self.name,
            width = self.config.width,
            height = self.config.height,
            fps = self.config.fps,
            "Synthetic source started"
        );
        self.running = true;
        self.next_due = None;
        Ok(())
    }

    fn grab_next(&mut self) -> Result<Grab> {
        if !self.running {
            return Err(TrackerError::from_source(&self.name, "grab before start"));
        }
        if self.config.frame_count.is_some_and(|limit| self.emitted >= limit) {
            return Ok(Grab::EndOfStream);
        }

        self.wait_for_next_slot();
        self.hardware_counter += 1;
        if let Some(n) = self.config.drop_every.filter(|n| *n > 1) {
            if self.hardware_counter % n == 0 {
                debug!(
                    source = %self.name,
                    frame = self.hardware_counter,
                    "Simulated hardware drop"
                );
                self.hardware_counter += 1;
            }
        }
        self.emitted += 1;

        Ok(Grab::Frame(Frame {
            data: Bytes::from(self.render()),
            meta: Arc::new(FrameMetadata {
                eye: self.eye,
                frame_number: self.hardware_counter,
                hardware_frame_number: self.hardware_counter,
                width: self.config.width,
                height: self.config.height,
                stride: self.config.width,
                format: PixelFormat::Gray8,
                seconds: wall_clock_seconds(),
            }),
            timestamp: Instant::now(),
        }))
    }

    fn stop(&mut self) -> Result<()> {
        if self.running {
            info!(source = %self.name, frames = self.emitted, "Synthetic source stopped");
        }
        self.running = false;
        Ok(())
    }

    fn frame_rate(&self) -> f64 {
        self.config.fps
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.config.width, self.config.height)
    }

    fn as_movable(&mut self) -> Option<&mut dyn MovableSource> {
        Some(self)
    }
}

impl MovableSource for SyntheticSource {
    fn center(&mut self, point: (u32, u32)) {
        self.roi_offset = (
            point.0 as i32 - self.config.width as i32 / 2,
            point.1 as i32 - self.config.height as i32 / 2,
        );
    }

    fn move_by(&mut self, direction: Direction) {
        let (dx, dy) = match direction {
            Direction::Up => (0, -ROI_STEP),
            Direction::Down => (0, ROI_STEP),
            Direction::Left => (-ROI_STEP, 0),
            Direction::Right => (ROI_STEP, 0),
        };
        self.roi_offset.0 += dx;
        self.roi_offset.1 += dy;
    }
}

/// Deterministic source yielding an exact list of frame numbers, then
/// end of stream.
pub struct ScriptedSource {
    name: String,
    eye: Eye,
    frame_numbers: VecDeque<u64>,
    interval: Option<Duration>,
    fail_after: Option<usize>,
    grabbed: usize,
    mode: SourceMode,
    frame_rate: f64,
    frame_size: (u32, u32),
    running: bool,
}

impl ScriptedSource {
    pub fn new(eye: Eye, frame_numbers: impl IntoIterator<Item = u64>) -> Self {
        Self {
            name: format!("scripted-{}", eye.label()),
            eye,
            frame_numbers: frame_numbers.into_iter().collect(),
            interval: None,
            fail_after: None,
            grabbed: 0,
            mode: SourceMode::Camera,
            frame_rate: 100.0,
            frame_size: (8, 8),
            running: false,
        }
    }

    /// Sleep this long before every grab
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Return a fatal error once `count` frames have been grabbed
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn as_video(mut self) -> Self {
        self.mode = SourceMode::Video;
        self
    }

    pub fn with_frame_rate(mut self, frame_rate: f64) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn with_frame_size(mut self, width: u32, height: u32) -> Self {
        self.frame_size = (width, height);
        self
    }
}

impl FrameSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn eye(&self) -> Eye {
        self.eye
    }

    fn start(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn grab_next(&mut self) -> Result<Grab> {
        if !self.running {
            return Ok(Grab::EndOfStream);
        }
        if let Some(interval) = self.interval {
            thread::sleep(interval);
        }
        if self.fail_after.is_some_and(|limit| self.grabbed >= limit) {
            return Err(TrackerError::from_source(&self.name, "camera disconnected"));
        }
        let Some(frame_number) = self.frame_numbers.pop_front() else {
            return Ok(Grab::EndOfStream);
        };
        self.grabbed += 1;

        let (width, height) = self.frame_size;
        Ok(Grab::Frame(Frame {
            data: Bytes::from(vec![BACKGROUND; (width * height) as usize]),
            meta: Arc::new(FrameMetadata {
                eye: self.eye,
                frame_number,
                hardware_frame_number: frame_number,
                width,
                height,
                stride: width,
                format: PixelFormat::Gray8,
                seconds: frame_number as f64 / self.frame_rate.max(1.0),
            }),
            timestamp: Instant::now(),
        }))
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn frame_size(&self) -> (u32, u32) {
        self.frame_size
    }

    fn mode(&self) -> SourceMode {
        self.mode
    }
}
