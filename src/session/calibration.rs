//! Calibration session collecting pupil samples while the subject fixates

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::capture::{Eye, EyeCollection};
use crate::error::Result;
use crate::pipeline::consumer::{BoundedConsumer, ConsumerSink};
use crate::pipeline::data::{CalibrationParameters, ProcessedResult};

#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    sum_x: f64,
    sum_y: f64,
    count: usize,
}

impl Accumulator {
    fn mean(&self) -> Option<(f32, f32)> {
        (self.count > 0).then(|| {
            (
                (self.sum_x / self.count as f64) as f32,
                (self.sum_y / self.count as f64) as f32,
            )
        })
    }
}

type Samples = Arc<Mutex<EyeCollection<Accumulator>>>;

struct SampleSink(Samples);

impl ConsumerSink<ProcessedResult> for SampleSink {
    fn consume(&mut self, result: ProcessedResult) -> Result<()> {
        let mut samples = self.0.lock();
        for (eye, data) in result.eyes.iter() {
            let Some(pupil) = data.pupil else {
                continue;
            };
            if samples.get(eye).is_none() {
                samples.set(eye, Accumulator::default());
            }
            if let Some(acc) = samples.get_mut(eye) {
                acc.sum_x += pupil.center.0 as f64;
                acc.sum_y += pupil.center.1 as f64;
                acc.count += 1;
            }
        }
        Ok(())
    }
}

/// Collects pupil positions from processed results on its own consumer
/// thread. Finishing turns the mean position of each eye into its new
/// straight-ahead reference.
pub struct CalibrationSession {
    consumer: BoundedConsumer<ProcessedResult>,
    samples: Samples,
}

impl CalibrationSession {
    pub fn start(buffer_size: usize) -> Result<Self> {
        let samples: Samples = Arc::default();
        let consumer = BoundedConsumer::new("calibration", buffer_size);
        consumer.start(SampleSink(samples.clone()))?;
        info!("Calibration started");
        Ok(Self { consumer, samples })
    }

    pub fn try_add(&self, result: &ProcessedResult) -> bool {
        self.consumer.try_add(result.clone(), result.frame_number())
    }

    /// Samples collected so far for `eye`
    pub fn samples(&self, eye: Eye) -> usize {
        self.samples.lock().get(eye).map_or(0, |acc| acc.count)
    }

    /// Stops collecting once item `last` was consumed (or after `timeout`),
    /// right away when `last` is `None`, and derives new parameters from
    /// `current`. Eyes without samples keep their previous reference.
    pub fn finish(
        &self,
        last: Option<u64>,
        timeout: Duration,
        current: &CalibrationParameters,
    ) -> Result<CalibrationParameters> {
        match last {
            Some(last) => self.consumer.stop_at(last, timeout),
            None => self.consumer.stop(),
        }
        self.consumer.wait()?;

        let samples = self.samples.lock();
        let mut updated = current.clone();
        for (eye, acc) in samples.iter() {
            if let Some(reference) = acc.mean() {
                updated.set_reference(eye, reference);
            }
        }
        info!(
            left = ?updated.left_reference,
            right = ?updated.right_reference,
            "Calibration finished"
        );
        Ok(updated)
    }

    /// Stops without producing parameters
    pub fn cancel(&self) {
        self.consumer.stop();
    }
}
