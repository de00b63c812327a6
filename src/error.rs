use thiserror::Error;

use crate::camera::CameraProperty;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Camera unavailable: {0}")]
    CameraUnavailable(String),

    #[error("Frame acquisition failed: {0}")]
    FrameAcquisition(String),

    #[error("Camera rejected {property} = {value}")]
    PropertyRejected { property: CameraProperty, value: f64 },

    #[error("Detection engine reconfiguration failed: {0}")]
    EngineReconfiguration(String),

    #[error("Finish line endpoints must differ")]
    DegenerateFinishLine,

    #[error("Invalid detector config: {0}")]
    InvalidConfig(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "camera")]
    #[error("OpenCV Error: {0}")]
    OpenCv(#[from] opencv::Error),
}
