use nalgebra as na;

/// A marker position and the time it was observed at (seconds).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sighting {
    pub center: na::Point2<f32>,
    pub ts: f64,
}

impl Sighting {
    #[inline]
    pub fn new(center: na::Point2<f32>, ts: f64) -> Self {
        Self { center, ts }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Unconfirmed,
    Confirming,
    Confirmed,
}

#[derive(Debug, Clone, Default)]
pub struct TrackedMarker {
    /// Last position that was seen while confirmed; the anchor of crossing
    /// tests.
    pub confirmed_position: Option<Sighting>,
    pub last_seen_position: Option<Sighting>,
    pub consecutive_confirmations: u32,
}

impl TrackedMarker {
    #[inline]
    pub fn state(&self, required_frames: u32) -> TrackState {
        match self.consecutive_confirmations {
            0 => TrackState::Unconfirmed,
            n if n < required_frames => TrackState::Confirming,
            _ => TrackState::Confirmed,
        }
    }

    #[inline]
    pub fn break_streak(&mut self) {
        self.consecutive_confirmations = 0;
    }
}
