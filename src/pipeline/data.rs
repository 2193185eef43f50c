//! Per-eye results and the fused record emitted for every frame set

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::{Eye, EyeCollection, FrameSet};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PupilData {
    /// Pixel coordinates in the eye image
    pub center: (f32, f32),
    pub radius: f32,
    pub area: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EyeData {
    pub eye: Eye,
    pub frame_number: u64,
    pub seconds: f64,
    pub pupil: Option<PupilData>,
    pub iris_radius: Option<f32>,
    pub torsion_degrees: Option<f32>,
}

impl EyeData {
    pub fn empty(eye: Eye, frame_number: u64, seconds: f64) -> Self {
        Self {
            eye,
            frame_number,
            seconds,
            pupil: None,
            iris_radius: None,
            torsion_degrees: None,
        }
    }
}

/// What an eye algorithm returns for one image
#[derive(Debug, Clone)]
pub struct EyeProcessingOutput {
    pub data: EyeData,
    pub torsion_image: Option<Bytes>,
}

/// One head-motion sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HeadData {
    pub seconds: f64,
    pub acceleration: [f32; 3],
    pub angular_velocity: [f32; 3],
}

/// Gaze direction in degrees relative to the calibrated straight-ahead
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibratedGaze {
    pub horizontal: f32,
    pub vertical: f32,
}

/// Per-eye reference pupil position and image scale
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParameters {
    pub left_reference: Option<(f32, f32)>,
    pub right_reference: Option<(f32, f32)>,
    pub pixels_per_degree: f32,
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        Self {
            left_reference: None,
            right_reference: None,
            pixels_per_degree: 10.0,
        }
    }
}

impl CalibrationParameters {
    pub fn reference(&self, eye: Eye) -> Option<(f32, f32)> {
        match eye {
            Eye::Left => self.left_reference,
            Eye::Right => self.right_reference,
        }
    }

    pub fn set_reference(&mut self, eye: Eye, reference: (f32, f32)) {
        match eye {
            Eye::Left => self.left_reference = Some(reference),
            Eye::Right => self.right_reference = Some(reference),
        }
    }

    /// Gaze for every eye that has both a pupil and a reference
    pub fn apply(&self, eyes: &EyeCollection<EyeData>) -> EyeCollection<CalibratedGaze> {
        let scale = if self.pixels_per_degree > 0.0 {
            self.pixels_per_degree
        } else {
            1.0
        };
        let mut gaze = EyeCollection::default();
        for (eye, data) in eyes.iter() {
            if let (Some(pupil), Some((rx, ry))) = (data.pupil, self.reference(eye)) {
                gaze.set(
                    eye,
                    CalibratedGaze {
                        horizontal: (pupil.center.0 - rx) / scale,
                        // image y grows downwards
                        vertical: (ry - pupil.center.1) / scale,
                    },
                );
            }
        }
        gaze
    }
}

/// A frame set after both eyes were processed, in emission order
#[derive(Debug, Clone)]
pub struct ProcessedResult {
    /// Dispatcher order key, distinct from the camera frame number
    pub sequence: u64,
    pub frames: FrameSet,
    pub eyes: EyeCollection<EyeData>,
    pub torsion_images: EyeCollection<Bytes>,
    pub head: Option<HeadData>,
    pub calibrated: EyeCollection<CalibratedGaze>,
}

impl ProcessedResult {
    pub fn frame_number(&self) -> u64 {
        self.frames.frame_number
    }
}
