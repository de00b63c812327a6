use std::fmt;
use std::thread;
use std::time::Duration;

use serde_derive::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CameraConfig;
use crate::error::Error;
use crate::frame::GrayFrame;
use crate::scene::Overlay;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CameraProperty {
    FrameWidth,
    FrameHeight,
    Fps,
    Autofocus,
    Focus,
    AutoExposure,
    Exposure,
    Gain,
    Brightness,
    Contrast,
}

impl CameraProperty {
    pub fn name(&self) -> &'static str {
        match self {
            CameraProperty::FrameWidth => "frame width",
            CameraProperty::FrameHeight => "frame height",
            CameraProperty::Fps => "fps",
            CameraProperty::Autofocus => "autofocus",
            CameraProperty::Focus => "focus",
            CameraProperty::AutoExposure => "auto exposure",
            CameraProperty::Exposure => "exposure",
            CameraProperty::Gain => "gain",
            CameraProperty::Brightness => "brightness",
            CameraProperty::Contrast => "contrast",
        }
    }
}

impl fmt::Display for CameraProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A frame source that can also render the live feed.
pub trait Camera: Send {
    /// Grabs the next frame as luminance. `Ok(None)` means the device had
    /// nothing to deliver this time.
    fn read(&mut self) -> Result<Option<GrayFrame>, Error>;

    /// Fails with [`Error::PropertyRejected`] when the device does not
    /// support the property or refuses the value.
    fn set_property(&mut self, property: CameraProperty, value: f64) -> Result<(), Error>;

    /// Draws `overlay` onto the last frame read and encodes it as JPEG.
    fn encode(&mut self, overlay: &Overlay) -> Result<Vec<u8>, Error>;

    fn release(&mut self);
}

/// Opens the device described by the camera settings.
pub type CameraOpener = Box<dyn Fn(&CameraConfig) -> Result<Box<dyn Camera>, Error> + Send + Sync>;

/// Outcome of applying the property table at startup.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct PropertyReport {
    pub applied: Vec<(CameraProperty, f64)>,
    pub failed: Vec<(CameraProperty, f64, String)>,
}

impl PropertyReport {
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Applies every property, one failure does not stop the others.
pub fn apply_properties(camera: &mut dyn Camera, table: &[(CameraProperty, f64)]) -> PropertyReport {
    let mut report = PropertyReport::default();

    for &(property, value) in table {
        match camera.set_property(property, value) {
            Ok(()) => {
                debug!(%property, value, "camera property applied");
                report.applied.push((property, value));
            }
            Err(err) => {
                warn!(%property, value, error = %err, "camera property not applied");
                report.failed.push((property, value, err.to_string()));
            }
        }
    }

    report
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct FocusTuning {
    pub value: i32,
    pub score: f64,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Error)]
#[serde(rename_all = "snake_case")]
pub enum FocusTuningFailure {
    #[error("camera is not open")]
    CameraNotOpen,
    #[error("camera does not support manual focus")]
    FocusUnsupported,
    #[error("camera delivered no frames during the sweep")]
    NoFrames,
}

/// Coarse-then-fine sweep over the manual focus range.
#[derive(Debug, Clone)]
pub struct FocusSweep {
    pub min: i32,
    pub max: i32,
    pub coarse_step: i32,
    pub fine_step: i32,
    /// Frames dropped after every focus change while the lens moves.
    pub settle_frames: usize,
    pub settle_delay: Duration,
    /// How long autofocus stays on in the fallback toggle.
    pub autofocus_pulse: Duration,
}

impl Default for FocusSweep {
    fn default() -> Self {
        Self {
            min: 0,
            max: 255,
            coarse_step: 15,
            fine_step: 3,
            settle_frames: 2,
            settle_delay: Duration::from_millis(50),
            autofocus_pulse: Duration::from_millis(500),
        }
    }
}

const READ_ATTEMPTS: usize = 5;

impl FocusSweep {
    pub fn run(&self, camera: &mut dyn Camera) -> Result<FocusTuning, FocusTuningFailure> {
        let manual = camera.set_property(CameraProperty::Autofocus, 0.0).is_ok()
            && camera
                .set_property(CameraProperty::Focus, self.min as f64)
                .is_ok();

        if !manual {
            self.pulse_autofocus(camera);
            return Err(FocusTuningFailure::FocusUnsupported);
        }

        let coarse = self.sweep(camera, self.min, self.max, self.coarse_step.max(1))?;

        let lo = (coarse.value - self.coarse_step).max(self.min);
        let hi = (coarse.value + self.coarse_step).min(self.max);
        let fine = self.sweep(camera, lo, hi, self.fine_step.max(1))?;

        let best = if fine.score >= coarse.score { fine } else { coarse };

        camera
            .set_property(CameraProperty::Focus, best.value as f64)
            .map_err(|_| FocusTuningFailure::FocusUnsupported)?;
        info!(value = best.value, score = best.score, "focus tuned");

        Ok(best)
    }

    fn sweep(
        &self,
        camera: &mut dyn Camera,
        lo: i32,
        hi: i32,
        step: i32,
    ) -> Result<FocusTuning, FocusTuningFailure> {
        let mut best: Option<FocusTuning> = None;
        let mut value = lo;

        while value <= hi {
            let score = self.score(camera, value)?;
            debug!(value, score, "focus candidate");

            if best.map_or(true, |b| score > b.score) {
                best = Some(FocusTuning { value, score });
            }

            value += step;
        }

        best.ok_or(FocusTuningFailure::NoFrames)
    }

    fn score(&self, camera: &mut dyn Camera, value: i32) -> Result<f64, FocusTuningFailure> {
        camera
            .set_property(CameraProperty::Focus, value as f64)
            .map_err(|_| FocusTuningFailure::FocusUnsupported)?;

        if !self.settle_delay.is_zero() {
            thread::sleep(self.settle_delay);
        }

        for _ in 0..self.settle_frames {
            let _ = camera.read();
        }

        for _ in 0..READ_ATTEMPTS {
            if let Ok(Some(frame)) = camera.read() {
                return Ok(frame.sharpness());
            }
        }

        Err(FocusTuningFailure::NoFrames)
    }

    fn pulse_autofocus(&self, camera: &mut dyn Camera) {
        warn!("manual focus unsupported, toggling autofocus instead");

        let _ = camera.set_property(CameraProperty::Autofocus, 0.0);
        thread::sleep(self.autofocus_pulse);
        let _ = camera.set_property(CameraProperty::Autofocus, 1.0);
    }
}
