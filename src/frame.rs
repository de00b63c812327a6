use ndarray::{s, Array2, ArrayView2};

use crate::detection::MarkerObservation;
use crate::error::Error;

/// Single-channel 8-bit image, row-major (`[row, col]`).
#[derive(Debug, Clone)]
pub struct GrayFrame {
    pixels: Array2<u8>,
}

impl GrayFrame {
    #[inline]
    pub fn new(pixels: Array2<u8>) -> Self {
        Self { pixels }
    }

    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Result<Self, Error> {
        let pixels = Array2::from_shape_vec((height as usize, width as usize), data).map_err(|e| {
            Error::FrameAcquisition(format!("{}x{} luminance plane: {}", width, height, e))
        })?;

        Ok(Self { pixels })
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.pixels.ncols() as u32
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.pixels.nrows() as u32
    }

    #[inline]
    pub fn pixels(&self) -> ArrayView2<'_, u8> {
        self.pixels.view()
    }

    /// Global histogram equalization. Lifts contrast of dim or washed-out
    /// frames before decoding; a flat image is left untouched.
    pub fn equalize(&mut self) {
        let mut hist = [0usize; 256];
        for &v in self.pixels.iter() {
            hist[v as usize] += 1;
        }

        let total = self.pixels.len();
        let mut cdf = [0usize; 256];
        let mut acc = 0;
        for (c, h) in cdf.iter_mut().zip(hist.iter()) {
            acc += h;
            *c = acc;
        }

        let cdf_min = cdf.iter().copied().find(|&c| c > 0).unwrap_or(0);
        if total <= cdf_min {
            return;
        }

        let scale = 255.0 / (total - cdf_min) as f32;
        let mut lut = [0u8; 256];
        for (l, &c) in lut.iter_mut().zip(cdf.iter()) {
            *l = (c.saturating_sub(cdf_min) as f32 * scale).round().min(255.0) as u8;
        }

        self.pixels.mapv_inplace(|v| lut[v as usize]);
    }

    /// Variance of the 4-neighbour Laplacian response. Sharper images have
    /// stronger edges and score higher.
    pub fn sharpness(&self) -> f64 {
        if self.pixels.nrows() < 3 || self.pixels.ncols() < 3 {
            return 0.0;
        }

        let a = self.pixels.mapv(f64::from);
        let center = a.slice(s![1..-1, 1..-1]);

        let lap = &a.slice(s![..-2, 1..-1]) + &a.slice(s![2.., 1..-1])
            + &a.slice(s![1..-1, ..-2])
            + &a.slice(s![1..-1, 2..])
            - &(&center * 4.0);

        lap.var(0.0)
    }
}

/// Observations of one captured frame.
pub struct Frame {
    pub dims: (u32, u32),
    pub observations: Vec<MarkerObservation>,
    pub timestamp: f64, // in seconds
}

impl Frame {
    #[inline]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &MarkerObservation> {
        self.observations.iter()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}
