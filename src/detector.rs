use serde_derive::{Deserialize, Serialize};

use crate::detection::MarkerObservation;
use crate::error::Error;
use crate::frame::GrayFrame;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TagFamily {
    Tag16h5,
    Tag25h9,
    Tag36h11,
}

/// Construction parameters of the detection engine. Changing any of them
/// requires a new engine instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineParams {
    pub family: TagFamily,
    pub threads: u8,
    pub quad_decimate: f32,
    pub quad_sigma: f32,
    pub refine_edges: bool,
    pub decode_sharpening: f64,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            family: TagFamily::Tag16h5,
            threads: 4,
            quad_decimate: 1.0,
            quad_sigma: 0.0,
            refine_edges: true,
            decode_sharpening: 0.25,
        }
    }
}

impl EngineParams {
    pub fn validate(&self) -> Result<(), Error> {
        if self.threads < 1 {
            return Err(Error::InvalidConfig("threads must be at least 1".into()));
        }

        if !(self.quad_decimate >= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "quad_decimate must be >= 1, got {}",
                self.quad_decimate
            )));
        }

        if !(self.quad_sigma >= 0.0) || !(self.decode_sharpening >= 0.0) {
            return Err(Error::InvalidConfig(
                "quad_sigma and decode_sharpening must not be negative".into(),
            ));
        }

        Ok(())
    }
}

/// A fiducial detector. Implementations are swapped as a whole when their
/// construction parameters change.
pub trait MarkerEngine: Send {
    fn detect(&mut self, frame: &GrayFrame) -> Result<Vec<MarkerObservation>, Error>;
}

/// Creates engine instances; called once at startup and on every
/// reconfiguration that needs a fresh engine.
pub type EngineBuilder =
    Box<dyn Fn(&EngineParams) -> Result<Box<dyn MarkerEngine>, Error> + Send + Sync>;

/// Outcome of comparing old and new engine parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconfigure {
    pub params: EngineParams,
}

/// Decides whether moving from `old` to `new` needs a new engine instance.
pub fn reconfigure(old: &EngineParams, new: &EngineParams) -> Option<Reconfigure> {
    if old == new {
        None
    } else {
        Some(Reconfigure {
            params: new.clone(),
        })
    }
}

#[cfg(feature = "camera")]
pub use self::april::AprilTagEngine;

#[cfg(feature = "camera")]
mod april {
    use apriltag::{DetectorBuilder, Family, Image};
    use nalgebra as na;

    use super::{EngineParams, MarkerEngine, TagFamily};
    use crate::detection::MarkerObservation;
    use crate::error::Error;
    use crate::frame::GrayFrame;

    const BITS_CORRECTED: usize = 1;

    pub struct AprilTagEngine {
        detector: apriltag::Detector,
    }

    impl AprilTagEngine {
        pub fn new(params: &EngineParams) -> Result<Self, Error> {
            let family = match params.family {
                TagFamily::Tag16h5 => Family::tag_16h5(),
                TagFamily::Tag25h9 => Family::tag_25h9(),
                TagFamily::Tag36h11 => Family::tag_36h11(),
            };

            let mut detector = DetectorBuilder::new()
                .add_family_bits(family, BITS_CORRECTED)
                .build()
                .map_err(|e| Error::EngineReconfiguration(format!("{:?}", e)))?;

            detector.set_thread_number(params.threads);
            detector.set_decimation(params.quad_decimate);
            detector.set_sigma(params.quad_sigma);
            detector.set_refine_edges(params.refine_edges);
            detector.set_shapening(params.decode_sharpening);

            Ok(Self { detector })
        }

        /// Builder suitable for [`crate::LapDetector`].
        pub fn builder() -> super::EngineBuilder {
            Box::new(|params| Ok(Box::new(AprilTagEngine::new(params)?) as Box<dyn MarkerEngine>))
        }
    }

    impl MarkerEngine for AprilTagEngine {
        fn detect(&mut self, frame: &GrayFrame) -> Result<Vec<MarkerObservation>, Error> {
            let (width, height) = (frame.width() as usize, frame.height() as usize);
            let mut image = Image::zeros_with_stride(width, height, width).ok_or_else(|| {
                Error::FrameAcquisition(format!("cannot allocate {}x{} image", width, height))
            })?;

            for ((row, col), &v) in frame.pixels().indexed_iter() {
                image[(col, row)] = v;
            }

            let observations = self
                .detector
                .detect(&image)
                .into_iter()
                .map(|det| {
                    let [cx, cy] = det.center();
                    let corners = det.corners().map(|[x, y]| na::Point2::new(x as f32, y as f32));

                    MarkerObservation {
                        id: det.id() as _,
                        center: na::Point2::new(cx as f32, cy as f32),
                        confidence: det.decision_margin(),
                        bit_error: det.hamming() as _,
                        corners,
                    }
                })
                .collect();

            Ok(observations)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_params_keep_engine() {
        let params = EngineParams::default();
        assert_eq!(reconfigure(&params, &params.clone()), None);
    }

    #[test]
    fn changed_params_need_new_engine() {
        let old = EngineParams::default();
        let new = EngineParams {
            quad_decimate: 2.0,
            ..old.clone()
        };

        assert_eq!(
            reconfigure(&old, &new),
            Some(Reconfigure { params: new.clone() })
        );
    }

    #[test]
    fn validates_decimation() {
        let params = EngineParams {
            quad_decimate: 0.5,
            ..EngineParams::default()
        };

        assert!(params.validate().is_err());
        assert!(EngineParams::default().validate().is_ok());
    }

    #[test]
    fn family_names() {
        assert_eq!(
            serde_json::to_value(TagFamily::Tag36h11).unwrap(),
            serde_json::json!("tag36h11")
        );
    }
}
