use std::fs;
use std::path::Path;
use std::str::FromStr;

use nalgebra as na;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::camera::CameraProperty;
use crate::detector::EngineParams;
use crate::error::Error;

pub const DEFAULT_LOCK_PORT: u16 = 57001;
pub const DEFAULT_LAP_QUEUE: usize = 256;

/// Thresholds and tracking behaviour. Every field can be changed while the
/// capture loop runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DetectorConfig {
    pub min_decision_margin: f32,
    pub max_hamming: u32,
    pub min_tag_area: f32,
    pub min_detection_frames: u32,
    pub allow_quick_pass: bool,
    pub quick_pass_time: f64,
    /// Debounce interval: minimum seconds between two laps of one marker.
    pub min_lap_time: f64,
    pub enhance_contrast: bool,
    #[serde(flatten)]
    pub engine: EngineParams,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_decision_margin: 30.0,
            max_hamming: 0,
            min_tag_area: 100.0,
            min_detection_frames: 2,
            allow_quick_pass: true,
            quick_pass_time: 0.5,
            min_lap_time: 2.0,
            enhance_contrast: false,
            engine: EngineParams::default(),
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.min_lap_time > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "min_lap_time must be positive, got {}",
                self.min_lap_time
            )));
        }

        if self.min_detection_frames < 1 {
            return Err(Error::InvalidConfig(
                "min_detection_frames must be at least 1".into(),
            ));
        }

        if !(self.quick_pass_time >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "quick_pass_time must not be negative, got {}",
                self.quick_pass_time
            )));
        }

        self.engine.validate()
    }

    /// Applies the known keys of a partial JSON object on top of `self`.
    ///
    /// Unknown keys and values of the wrong type are skipped; the merged
    /// result must still pass [`DetectorConfig::validate`].
    pub fn merge(&self, patch: &Value) -> Result<Self, Error> {
        let mut current = serde_json::to_value(self)?;

        if let (Some(fields), Some(patch)) = (current.as_object_mut(), patch.as_object()) {
            for (key, value) in patch {
                if !fields.contains_key(key) {
                    debug!(key = %key, "ignoring unknown detector config key");
                    continue;
                }

                let previous = fields.insert(key.clone(), value.clone());
                if serde_json::from_value::<DetectorConfig>(Value::Object(fields.clone())).is_err() {
                    debug!(key = %key, value = %value, "ignoring malformed detector config value");
                    if let Some(previous) = previous {
                        fields.insert(key.clone(), previous);
                    }
                }
            }
        }

        let merged: DetectorConfig = serde_json::from_value(current)?;
        merged.validate()?;

        Ok(merged)
    }

    #[inline]
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Virtual finish line in frame pixel coordinates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(try_from = "[[f32; 2]; 2]", into = "[[f32; 2]; 2]")]
pub struct FinishLine {
    a: na::Point2<f32>,
    b: na::Point2<f32>,
}

impl FinishLine {
    pub fn new(a: na::Point2<f32>, b: na::Point2<f32>) -> Result<Self, Error> {
        if a == b {
            return Err(Error::DegenerateFinishLine);
        }

        Ok(Self { a, b })
    }

    #[inline]
    pub fn endpoints(&self) -> (&na::Point2<f32>, &na::Point2<f32>) {
        (&self.a, &self.b)
    }

    /// Whether both endpoints lie inside a frame of `(width, height)`.
    pub fn fits(&self, (width, height): (u32, u32)) -> bool {
        let inside = |p: &na::Point2<f32>| {
            p.x >= 0.0 && p.y >= 0.0 && p.x <= width as f32 && p.y <= height as f32
        };

        inside(&self.a) && inside(&self.b)
    }

    /// Whether the move `from` -> `to` touches or crosses the line.
    #[inline]
    pub fn is_crossed(&self, from: &na::Point2<f32>, to: &na::Point2<f32>) -> bool {
        crate::math::segments_intersect(from, to, &self.a, &self.b)
    }
}

impl Default for FinishLine {
    fn default() -> Self {
        Self {
            a: na::Point2::new(100.0, 240.0),
            b: na::Point2::new(540.0, 240.0),
        }
    }
}

impl TryFrom<[[f32; 2]; 2]> for FinishLine {
    type Error = Error;

    fn try_from([a, b]: [[f32; 2]; 2]) -> Result<Self, Self::Error> {
        Self::new(na::Point2::new(a[0], a[1]), na::Point2::new(b[0], b[1]))
    }
}

impl From<FinishLine> for [[f32; 2]; 2] {
    fn from(line: FinishLine) -> Self {
        [[line.a.x, line.a.y], [line.b.x, line.b.y]]
    }
}

/// Camera device settings. `None` leaves the driver default untouched.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    pub index: i32,
    pub resolution: (u32, u32),
    pub fps: Option<u32>,
    pub autofocus: Option<i32>,
    pub focus: Option<i32>,
    pub auto_exposure: Option<i32>,
    pub exposure: Option<i32>,
    pub gain: Option<i32>,
    pub brightness: Option<i32>,
    pub contrast: Option<i32>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            index: 0,
            resolution: (640, 480),
            fps: Some(30),
            autofocus: None,
            focus: None,
            auto_exposure: None,
            exposure: None,
            gain: None,
            brightness: None,
            contrast: None,
        }
    }
}

impl CameraConfig {
    /// Properties to apply after opening the device, in application order.
    pub fn properties(&self) -> Vec<(CameraProperty, f64)> {
        let (width, height) = self.resolution;

        [
            (CameraProperty::FrameWidth, Some(width as i32)),
            (CameraProperty::FrameHeight, Some(height as i32)),
            (CameraProperty::Fps, self.fps.map(|v| v as i32)),
            (CameraProperty::Autofocus, self.autofocus),
            (CameraProperty::Focus, self.focus),
            (CameraProperty::AutoExposure, self.auto_exposure),
            (CameraProperty::Exposure, self.exposure),
            (CameraProperty::Gain, self.gain),
            (CameraProperty::Brightness, self.brightness),
            (CameraProperty::Contrast, self.contrast),
        ]
        .into_iter()
        .filter_map(|(prop, value)| value.map(|v| (prop, v as f64)))
        .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub camera: CameraConfig,
    pub finish_line: FinishLine,
    pub lock_port: u16,
    pub lap_queue: usize,
    pub detector: DetectorConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            camera: CameraConfig::default(),
            finish_line: FinishLine::default(),
            lock_port: DEFAULT_LOCK_PORT,
            lap_queue: DEFAULT_LAP_QUEUE,
            detector: DetectorConfig::default(),
        }
    }
}

impl Settings {
    /// Reads `CAMERA_*`, `FINISH_LINE_*` and `DETECTOR_LOCK_PORT` from the
    /// process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let (dw, dh) = defaults.camera.resolution;
        let (da, db) = defaults.finish_line.endpoints();

        let camera = CameraConfig {
            index: parse_or(&lookup, "CAMERA_IDX", defaults.camera.index),
            resolution: (
                parse_or(&lookup, "CAMERA_WIDTH", dw),
                parse_or(&lookup, "CAMERA_HEIGHT", dh),
            ),
            fps: match lookup("CAMERA_FPS") {
                None => defaults.camera.fps,
                Some(_) => parse_optional(&lookup, "CAMERA_FPS").and_then(|v| u32::try_from(v).ok()),
            },
            autofocus: parse_optional(&lookup, "CAMERA_AUTOFOCUS"),
            focus: parse_optional(&lookup, "CAMERA_FOCUS"),
            auto_exposure: parse_optional(&lookup, "CAMERA_AUTO_EXPOSURE"),
            exposure: parse_optional(&lookup, "CAMERA_EXPOSURE"),
            gain: parse_optional(&lookup, "CAMERA_GAIN"),
            brightness: parse_optional(&lookup, "CAMERA_BRIGHTNESS"),
            contrast: parse_optional(&lookup, "CAMERA_CONTRAST"),
        };

        let finish_line = FinishLine::new(
            na::Point2::new(
                parse_or(&lookup, "FINISH_LINE_X1", da.x),
                parse_or(&lookup, "FINISH_LINE_Y1", da.y),
            ),
            na::Point2::new(
                parse_or(&lookup, "FINISH_LINE_X2", db.x),
                parse_or(&lookup, "FINISH_LINE_Y2", db.y),
            ),
        )?;

        Ok(Self {
            camera,
            finish_line,
            lock_port: parse_or(&lookup, "DETECTOR_LOCK_PORT", DEFAULT_LOCK_PORT),
            ..defaults
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let text = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&text)?;
        settings.detector.validate()?;

        Ok(settings)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Loads the settings file, creating it from the environment when it
    /// does not exist yet.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }

        let settings = Self::from_env()?;
        settings.save(path)?;
        debug!(path = %path.display(), "created settings file from environment");

        Ok(settings)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable setting, using default");
            default
        }),
        None => default,
    }
}

/// `-1` (or a missing key) means "leave unset".
fn parse_optional<F>(lookup: &F, key: &str) -> Option<i32>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_or(lookup, key, -1) {
        -1 => None,
        v => Some(v),
    }
}
