use std::collections::HashMap;

use serde_derive::{Deserialize, Serialize};

use crate::MarkerId;

/// A completed lap.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct LapEvent {
    pub marker_id: MarkerId,
    /// Lap duration in seconds.
    pub duration: f64,
    /// Crossing time that completed the lap.
    pub timestamp: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimerOutcome {
    /// First crossing of this marker; the clock starts.
    Start,
    Lap(LapEvent),
    /// Too close to the previous accepted crossing.
    Debounced,
}

#[derive(Debug, Default)]
pub struct LapTimer {
    last_crossing: HashMap<MarkerId, f64>,
}

impl LapTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_crossing(&mut self, id: MarkerId, ts: f64, debounce: f64) -> TimerOutcome {
        match self.last_crossing.get(&id).copied() {
            None => {
                self.last_crossing.insert(id, ts);
                TimerOutcome::Start
            }
            Some(last) if ts - last > debounce => {
                self.last_crossing.insert(id, ts);
                TimerOutcome::Lap(LapEvent {
                    marker_id: id,
                    duration: ts - last,
                    timestamp: ts,
                })
            }
            Some(_) => TimerOutcome::Debounced,
        }
    }

    #[inline]
    pub fn last_crossing(&self, id: MarkerId) -> Option<f64> {
        self.last_crossing.get(&id).copied()
    }

    pub fn forget(&mut self, id: MarkerId) {
        self.last_crossing.remove(&id);
    }

    pub fn clear(&mut self) {
        self.last_crossing.clear();
    }
}
