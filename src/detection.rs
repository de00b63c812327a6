use nalgebra as na;
use serde_derive::{Deserialize, Serialize};

use crate::{math, MarkerId};

/// One detected tag in one frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct MarkerObservation {
    pub id: MarkerId,
    pub center: na::Point2<f32>,
    /// Decision margin reported by the decoder; higher is better.
    #[serde(rename = "margin")]
    pub confidence: f32,
    /// Number of bits corrected while decoding.
    #[serde(rename = "hamming")]
    pub bit_error: u32,
    pub corners: [na::Point2<f32>; 4],
}

impl MarkerObservation {
    /// Area of the quad spanned by the corners, in square pixels.
    #[inline]
    pub fn area(&self) -> f32 {
        math::polygon_area(&self.corners)
    }

    /// Builds an axis-aligned square observation around `center`. Handy for
    /// synthetic input.
    pub fn square(id: MarkerId, center: na::Point2<f32>, side: f32, confidence: f32) -> Self {
        let h = side / 2.0;
        let (x, y) = (center.x, center.y);

        Self {
            id,
            center,
            confidence,
            bit_error: 0,
            corners: [
                na::Point2::new(x - h, y - h),
                na::Point2::new(x + h, y - h),
                na::Point2::new(x + h, y + h),
                na::Point2::new(x - h, y + h),
            ],
        }
    }
}
