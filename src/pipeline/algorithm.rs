//! Pluggable per-eye image processing

use std::collections::HashMap;
use std::sync::Arc;

use super::data::{CalibrationParameters, EyeData, EyeProcessingOutput, HeadData, PupilData};
use crate::capture::{decoder, Frame};
use crate::error::{Result, TrackerError};
use crate::PipelineSettings;

/// Processes images of one eye.
///
/// Instances are owned by a single eye thread and called repeatedly from
/// it, so implementations can keep state and need not be `Sync`.
pub trait EyeAlgorithm: Send {
    fn process(
        &mut self,
        frame: &Frame,
        calibration: &CalibrationParameters,
        settings: &PipelineSettings,
    ) -> Result<EyeProcessingOutput>;
}

/// Head-motion sensor sampled once per processed frame set
pub trait HeadSensor: Send + Sync {
    fn latest(&self) -> Option<HeadData>;
}

pub type AlgorithmFactory = Arc<dyn Fn() -> Box<dyn EyeAlgorithm> + Send + Sync>;

/// Maps a pipeline name to a factory building fresh algorithm instances
#[derive(Clone, Default)]
pub struct AlgorithmRegistry {
    factories: HashMap<String, AlgorithmFactory>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DarkPupil::NAME, || Box::new(DarkPupil));
        registry.register(NullAlgorithm::NAME, || Box::new(NullAlgorithm));
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn EyeAlgorithm> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn EyeAlgorithm>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| TrackerError::UnknownPipeline(name.to_string()))
    }
}

/// Dark-pupil detection: threshold the image and take the centroid of
/// the dark pixels. The radius follows from the area.
pub struct DarkPupil;

impl DarkPupil {
    pub const NAME: &'static str = "dark-pupil";
}

impl EyeAlgorithm for DarkPupil {
    fn process(
        &mut self,
        frame: &Frame,
        _calibration: &CalibrationParameters,
        settings: &PipelineSettings,
    ) -> Result<EyeProcessingOutput> {
        let plane = decoder::luma_plane(frame)?;
        let width = frame.meta.width.max(1) as usize;

        let (mut count, mut sum_x, mut sum_y) = (0u64, 0u64, 0u64);
        for (i, _) in plane
            .iter()
            .enumerate()
            .filter(|&(_, &px)| px < settings.pupil_threshold)
        {
            count += 1;
            sum_x += (i % width) as u64;
            sum_y += (i / width) as u64;
        }

        let mut data = EyeData::empty(frame.eye(), frame.frame_number(), frame.meta.seconds);
        if count >= settings.min_pupil_pixels as u64 && count > 0 {
            data.pupil = Some(PupilData {
                center: (sum_x as f32 / count as f32, sum_y as f32 / count as f32),
                radius: (count as f32 / std::f32::consts::PI).sqrt(),
                area: count as u32,
            });
        }

        Ok(EyeProcessingOutput {
            data,
            torsion_image: None,
        })
    }
}

/// Reports every image as processed without detecting anything
pub struct NullAlgorithm;

impl NullAlgorithm {
    pub const NAME: &'static str = "null";
}

impl EyeAlgorithm for NullAlgorithm {
    fn process(
        &mut self,
        frame: &Frame,
        _calibration: &CalibrationParameters,
        _settings: &PipelineSettings,
    ) -> Result<EyeProcessingOutput> {
        Ok(EyeProcessingOutput {
            data: EyeData::empty(frame.eye(), frame.frame_number(), frame.meta.seconds),
            torsion_image: None,
        })
    }
}
