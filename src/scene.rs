use std::collections::HashSet;

use nalgebra as na;
use tracing::{debug, info, warn};

use crate::config::{DetectorConfig, FinishLine};
use crate::filter::{MarkerFilter, Verdict};
use crate::frame::Frame;
use crate::lap_timer::{LapEvent, LapTimer, TimerOutcome};
use crate::track::{Sighting, TrackState};
use crate::tracker::CrossingTracker;
use crate::MarkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    All,
    Marker(MarkerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerMark {
    Rejected,
    Excluded,
    /// Accepted but not yet seen on enough consecutive frames.
    Confirming,
    Tracked,
    /// The sighting completed a lap (or started the clock).
    Crossed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayMarker {
    pub id: MarkerId,
    pub center: na::Point2<f32>,
    pub mark: MarkerMark,
}

/// What to draw on the live frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Overlay {
    pub finish_line: FinishLine,
    pub markers: Vec<OverlayMarker>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub laps: Vec<LapEvent>,
    pub overlay: Overlay,
}

/// Finish line plus the per-marker timing state.
#[derive(Debug)]
pub struct Scene {
    finish_line: FinishLine,
    tracker: CrossingTracker,
    timer: LapTimer,
    /// Frame size the finish line was last checked against.
    checked_dims: Option<(u32, u32)>,
}

impl Scene {
    pub fn new(finish_line: FinishLine) -> Self {
        Self {
            finish_line,
            tracker: CrossingTracker::new(),
            timer: LapTimer::new(),
            checked_dims: None,
        }
    }

    #[inline]
    pub fn finish_line(&self) -> &FinishLine {
        &self.finish_line
    }

    pub fn set_finish_line(&mut self, line: FinishLine) {
        self.finish_line = line;
        self.checked_dims = None;
    }

    #[inline]
    pub fn tracker(&self) -> &CrossingTracker {
        &self.tracker
    }

    #[inline]
    pub fn timer(&self) -> &LapTimer {
        &self.timer
    }

    pub fn reset(&mut self, scope: ResetScope) {
        match scope {
            ResetScope::All => {
                self.tracker.clear();
                self.timer.clear();
            }
            ResetScope::Marker(id) => {
                self.tracker.forget(id);
                self.timer.forget(id);
            }
        }
    }

    /// Runs one frame through filter, tracker and timer, in the order the
    /// observations were detected.
    pub fn update(
        &mut self,
        frame: &Frame,
        config: &DetectorConfig,
        allowed: Option<&HashSet<MarkerId>>,
    ) -> FrameReport {
        let filter = MarkerFilter::new(config, allowed);
        let ts = frame.timestamp;

        if self.checked_dims != Some(frame.dims) {
            self.checked_dims = Some(frame.dims);
            if !self.finish_line.fits(frame.dims) {
                warn!(dims = ?frame.dims, line = ?self.finish_line, "finish line leaves the frame");
            }
        }

        let mut laps = Vec::new();
        let mut markers = Vec::with_capacity(frame.len());
        let mut seen = HashSet::with_capacity(frame.len());

        for obs in frame.iter() {
            let sighting = Sighting::new(obs.center, ts);

            let mark = match filter.classify(obs) {
                Verdict::Reject(reason) => {
                    debug!(id = obs.id, %reason, margin = obs.confidence, "marker rejected");
                    self.tracker.reject(obs.id);
                    MarkerMark::Rejected
                }
                Verdict::NotAllowed => {
                    self.tracker.observe_excluded(obs.id, sighting);
                    MarkerMark::Excluded
                }
                Verdict::Accept => {
                    seen.insert(obs.id);

                    match self
                        .tracker
                        .observe(obs.id, sighting, &self.finish_line, config)
                    {
                        Some(kind) => {
                            debug!(id = obs.id, ?kind, ts, "finish line crossed");

                            match self.timer.on_crossing(obs.id, ts, config.min_lap_time) {
                                TimerOutcome::Start => {
                                    info!(id = obs.id, "marker started timing");
                                    MarkerMark::Crossed
                                }
                                TimerOutcome::Lap(lap) => {
                                    info!(id = lap.marker_id, duration = lap.duration, "lap completed");
                                    laps.push(lap);
                                    MarkerMark::Crossed
                                }
                                TimerOutcome::Debounced => MarkerMark::Tracked,
                            }
                        }
                        None => match self.tracker.get(obs.id) {
                            Some(m) if m.state(config.min_detection_frames) == TrackState::Confirmed => {
                                MarkerMark::Tracked
                            }
                            _ => MarkerMark::Confirming,
                        },
                    }
                }
            };

            markers.push(OverlayMarker {
                id: obs.id,
                center: obs.center,
                mark,
            });
        }

        self.tracker.end_frame(&seen);

        FrameReport {
            laps,
            overlay: Overlay {
                finish_line: self.finish_line,
                markers,
            },
        }
    }
}
