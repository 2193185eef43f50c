//! Recording of raw images, processed data and events to a directory

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::capture::{Eye, EyeCollection, FrameSet};
use crate::error::{Result, TrackerError};
use crate::pipeline::consumer::{BoundedConsumer, ConsumerSink, ConsumerStats};
use crate::pipeline::data::ProcessedResult;

pub const INDEX_FILE: &str = "frames.tsv";
pub const DATA_FILE: &str = "data.tsv";
pub const EVENTS_FILE: &str = "events.txt";

/// Which stream the raw images are taken from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageRecording {
    /// Every grabbed frame set, including those processing dropped
    #[default]
    Grabbed,
    /// Only frame sets that were processed, alongside their data
    Processed,
    None,
}

#[derive(Debug, Clone)]
pub struct RecorderOptions {
    pub buffer_size: usize,
    pub images: ImageRecording,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            images: ImageRecording::Grabbed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub frame_number: u64,
    pub message: String,
    pub data: Option<String>,
}

/// One raw file per eye plus an index of where each frame starts
struct RawImageSink {
    dir: PathBuf,
    files: EyeCollection<(BufWriter<File>, u64)>,
    index: BufWriter<File>,
}

impl RawImageSink {
    fn create(dir: &Path) -> Result<Self> {
        let mut index = BufWriter::new(File::create(dir.join(INDEX_FILE))?);
        writeln!(index, "frame\tseconds\teye\toffset\tlength\twidth\theight\tformat")?;
        Ok(Self {
            dir: dir.to_path_buf(),
            files: EyeCollection::default(),
            index,
        })
    }

    fn open(&mut self, eye: Eye) -> Result<()> {
        if self.files.get(eye).is_none() {
            let file = File::create(self.dir.join(format!("{}.raw", eye.label())))?;
            self.files.set(eye, (BufWriter::new(file), 0));
        }
        Ok(())
    }
}

impl ConsumerSink<FrameSet> for RawImageSink {
    fn consume(&mut self, frames: FrameSet) -> Result<()> {
        for (eye, frame) in frames.frames.iter() {
            self.open(eye)?;
            let Some((file, offset)) = self.files.get_mut(eye) else {
                continue;
            };
            file.write_all(&frame.data)?;
            let start = *offset;
            *offset += frame.data.len() as u64;
            writeln!(
                self.index,
                "{}\t{:.6}\t{}\t{}\t{}\t{}\t{}\t{:?}",
                frames.frame_number,
                frame.meta.seconds,
                eye.label(),
                start,
                frame.data.len(),
                frame.meta.width,
                frame.meta.height,
                frame.meta.format
            )?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some((file, _)) = self.files.get_mut(Eye::Left) {
            file.flush()?;
        }
        if let Some((file, _)) = self.files.get_mut(Eye::Right) {
            file.flush()?;
        }
        self.index.flush()?;
        Ok(())
    }
}

/// Tab-separated processed data, one row per frame set
struct DataSink {
    out: BufWriter<File>,
    images: Option<RawImageSink>,
}

impl DataSink {
    fn create(dir: &Path, images: Option<RawImageSink>) -> Result<Self> {
        let mut out = BufWriter::new(File::create(dir.join(DATA_FILE))?);
        let mut header: Vec<String> = ["frame", "seconds", "sequence"].map(String::from).to_vec();
        for eye in Eye::ALL {
            for field in ["x", "y", "radius", "gaze_h", "gaze_v"] {
                header.push(format!("{}_{field}", eye.label()));
            }
        }
        header.extend(
            [
                "head_seconds",
                "acc_x",
                "acc_y",
                "acc_z",
                "gyro_x",
                "gyro_y",
                "gyro_z",
            ]
            .map(String::from),
        );
        writeln!(out, "{}", header.join("\t"))?;
        Ok(Self { out, images })
    }
}

fn optional(value: Option<f32>) -> String {
    value.map(|v| format!("{v:.3}")).unwrap_or_default()
}

impl ConsumerSink<ProcessedResult> for DataSink {
    fn consume(&mut self, result: ProcessedResult) -> Result<()> {
        let mut row = vec![
            result.frame_number().to_string(),
            format!("{:.6}", result.frames.seconds),
            result.sequence.to_string(),
        ];
        for eye in Eye::ALL {
            let pupil = result.eyes.get(eye).and_then(|data| data.pupil);
            let gaze = result.calibrated.get(eye);
            row.push(optional(pupil.map(|p| p.center.0)));
            row.push(optional(pupil.map(|p| p.center.1)));
            row.push(optional(pupil.map(|p| p.radius)));
            row.push(optional(gaze.map(|g| g.horizontal)));
            row.push(optional(gaze.map(|g| g.vertical)));
        }
        match result.head {
            Some(head) => {
                row.push(format!("{:.6}", head.seconds));
                let motion = head.acceleration.iter().chain(&head.angular_velocity);
                row.extend(motion.map(|v| format!("{v:.4}")));
            }
            None => row.extend(std::iter::repeat(String::new()).take(7)),
        }
        writeln!(self.out, "{}", row.join("\t"))?;

        if let Some(images) = self.images.as_mut() {
            images.consume(result.frames)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(images) = self.images.as_mut() {
            images.finish()?;
        }
        self.out.flush()?;
        Ok(())
    }
}

struct EventSink {
    out: BufWriter<File>,
}

impl ConsumerSink<EventRecord> for EventSink {
    fn consume(&mut self, event: EventRecord) -> Result<()> {
        writeln!(
            self.out,
            "{}\t{}\t{}",
            event.frame_number,
            event.message,
            event.data.as_deref().unwrap_or("")
        )?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Writes a recording session through three independent consumers, so a
/// slow write on one never holds up the others or the pipeline.
pub struct Recorder {
    dir: PathBuf,
    options: RecorderOptions,
    images: BoundedConsumer<FrameSet>,
    data: BoundedConsumer<ProcessedResult>,
    events: BoundedConsumer<EventRecord>,
}

impl Recorder {
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn start(dir: &Path, options: RecorderOptions) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let images = BoundedConsumer::new("record-images", options.buffer_size);
        let data = BoundedConsumer::new("record-data", options.buffer_size);
        let events = BoundedConsumer::new("record-events", options.buffer_size);

        let (grabbed_images, processed_images) = match options.images {
            ImageRecording::Grabbed => (Some(RawImageSink::create(dir)?), None),
            ImageRecording::Processed => (None, Some(RawImageSink::create(dir)?)),
            ImageRecording::None => (None, None),
        };
        match grabbed_images {
            Some(sink) => images.start(sink)?,
            None => images.stop(),
        }
        data.start(DataSink::create(dir, processed_images)?)?;
        events.start(EventSink {
            out: BufWriter::new(File::create(dir.join(EVENTS_FILE))?),
        })?;

        info!(images = ?options.images, "Recording started");
        Ok(Self {
            dir: dir.to_path_buf(),
            options,
            images,
            data,
            events,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Raw frame set as grabbed
    pub fn try_record_images(&self, frames: &FrameSet) -> bool {
        self.options.images == ImageRecording::Grabbed
            && self.images.try_add(frames.clone(), frames.frame_number)
    }

    /// Processed data, with the images when recording processed frames
    pub fn try_record_images_and_data(&self, result: &ProcessedResult) -> bool {
        self.data.try_add(result.clone(), result.frame_number())
    }

    pub fn try_record_event(
        &self,
        message: impl Into<String>,
        frame_number: u64,
        data: Option<String>,
    ) -> bool {
        self.events.try_add(
            EventRecord {
                frame_number,
                message: message.into(),
                data,
            },
            frame_number,
        )
    }

    pub fn images_stats(&self) -> std::sync::Arc<ConsumerStats> {
        self.images.stats()
    }

    pub fn data_stats(&self) -> std::sync::Arc<ConsumerStats> {
        self.data.stats()
    }

    pub fn events_stats(&self) -> std::sync::Arc<ConsumerStats> {
        self.events.stats()
    }

    /// Finishes recording at frame `last` (everything when `None`),
    /// giving in-flight frames up to `timeout` to arrive, then waits for
    /// all files to be written.
    pub fn stop(&self, last: Option<u64>, timeout: Duration) -> Result<()> {
        match last {
            Some(last) => {
                self.images.stop_at(last, timeout);
                self.data.stop_at(last, timeout);
            }
            None => {
                self.images.stop();
                self.data.stop();
            }
        }
        self.events.stop();

        let results = [self.images.wait(), self.data.wait(), self.events.wait()];
        let errors = results.into_iter().filter_map(|r| r.err()).collect();
        info!(
            dir = %self.dir.display(),
            images = self.images.stats().consumed.get(),
            data = self.data.stats().consumed.get(),
            events = self.events.stats().consumed.get(),
            "Recording stopped"
        );
        TrackerError::combine(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::tests::gray_frame;
    use crate::pipeline::data::{EyeData, PupilData};

    fn pair(n: u64) -> FrameSet {
        FrameSet::new(
            EyeCollection::new(Some(gray_frame(Eye::Left, n)), Some(gray_frame(Eye::Right, n))),
            n,
        )
    }

    fn processed(n: u64) -> ProcessedResult {
        let mut left = EyeData::empty(Eye::Left, n, 0.0);
        left.pupil = Some(PupilData {
            center: (1.5, 2.5),
            radius: 1.0,
            area: 3,
        });
        ProcessedResult {
            sequence: n - 1,
            frames: pair(n),
            eyes: EyeCollection::single(Eye::Left, left),
            torsion_images: EyeCollection::default(),
            head: None,
            calibrated: EyeCollection::default(),
        }
    }

    #[test]
    fn test_records_images_data_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::start(dir.path(), RecorderOptions::default()).unwrap();
        for n in 1..=3 {
            assert!(recorder.try_record_images(&pair(n)));
            assert!(recorder.try_record_images_and_data(&processed(n)));
        }
        assert!(recorder.try_record_event("blink", 2, Some("left".into())));
        recorder.stop(Some(3), Duration::from_secs(5)).unwrap();

        // 3 frames of 16 bytes per eye
        assert_eq!(fs::metadata(dir.path().join("left.raw")).unwrap().len(), 48);
        assert_eq!(fs::metadata(dir.path().join("right.raw")).unwrap().len(), 48);

        let index = fs::read_to_string(dir.path().join(INDEX_FILE)).unwrap();
        assert_eq!(index.lines().count(), 1 + 6);
        assert!(index.lines().nth(3).unwrap().starts_with("2\t"));

        let data = fs::read_to_string(dir.path().join(DATA_FILE)).unwrap();
        let rows: Vec<&str> = data.lines().collect();
        assert_eq!(rows.len(), 4);
        assert!(rows[1].starts_with("1\t0.010000\t0\t1.500\t2.500\t1.000"));

        let events = fs::read_to_string(dir.path().join(EVENTS_FILE)).unwrap();
        assert_eq!(events.trim_end(), "2\tblink\tleft");
    }

    #[test]
    fn test_processed_image_mode_records_with_data() {
        let dir = tempfile::tempdir().unwrap();
        let options = RecorderOptions {
            images: ImageRecording::Processed,
            ..RecorderOptions::default()
        };
        let recorder = Recorder::start(dir.path(), options).unwrap();
        assert!(!recorder.try_record_images(&pair(1)));
        assert!(recorder.try_record_images_and_data(&processed(1)));
        recorder.stop(None, Duration::from_secs(1)).unwrap();

        assert_eq!(fs::metadata(dir.path().join("left.raw")).unwrap().len(), 16);
        assert_eq!(recorder.data_stats().consumed.get(), 1);
    }

    #[test]
    fn test_stop_waits_for_designated_last_frame() {
        let dir = tempfile::tempdir().unwrap();
        let recorder =
            std::sync::Arc::new(Recorder::start(dir.path(), RecorderOptions::default()).unwrap());
        assert!(recorder.try_record_images(&pair(1)));
        assert!(recorder.try_record_images_and_data(&processed(1)));

        let late = recorder.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            late.try_record_images(&pair(2)) && late.try_record_images_and_data(&processed(2))
        });
        recorder.stop(Some(2), Duration::from_secs(10)).unwrap();
        assert!(writer.join().unwrap());
        assert_eq!(recorder.images_stats().consumed.get(), 2);
    }
}
