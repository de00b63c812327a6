pub mod camera;
pub mod config;
pub mod control;
pub mod detection;
pub mod detector;
pub mod error;
pub mod filter;
pub mod frame;
pub mod lap_timer;
pub mod lock;
pub mod math;
pub mod scene;
pub mod track;
pub mod tracker;

#[cfg(feature = "camera")]
pub mod opencv_camera;

mod capture;

pub use camera::{Camera, CameraProperty, FocusTuning, FocusTuningFailure, PropertyReport};
pub use config::{CameraConfig, DetectorConfig, FinishLine, Settings};
pub use control::{Backend, LapDetector};
pub use detection::MarkerObservation;
pub use detector::{EngineParams, MarkerEngine, TagFamily};
pub use error::Error;
pub use frame::{Frame, GrayFrame};
pub use lap_timer::LapEvent;
pub use scene::ResetScope;

use nalgebra as na;

/// Fiducial marker id as decoded by the detection engine.
pub type MarkerId = u32;

pub trait Float: num_traits::Float + na::Scalar {}

impl<T> Float for T where T: num_traits::Float + na::Scalar {}
