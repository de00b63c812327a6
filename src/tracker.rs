use std::collections::{HashMap, HashSet};

use crate::config::{DetectorConfig, FinishLine};
use crate::track::{Sighting, TrackedMarker};
use crate::MarkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingKind {
    /// Confirmed position to confirmed position.
    Confirmed,
    /// Confirmed position to a not yet confirmed sighting.
    QuickPass,
}

/// Per-marker confirmation and crossing detection.
#[derive(Debug, Default)]
pub struct CrossingTracker {
    markers: HashMap<MarkerId, TrackedMarker>,
}

impl CrossingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, id: MarkerId) -> Option<&TrackedMarker> {
        self.markers.get(&id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// A filtered-out detection invalidates the streak in progress.
    pub fn reject(&mut self, id: MarkerId) {
        if let Some(marker) = self.markers.get_mut(&id) {
            marker.break_streak();
        }
    }

    /// Marker outside the allowed set: keep recency, nothing else.
    pub fn observe_excluded(&mut self, id: MarkerId, sighting: Sighting) {
        self.markers.entry(id).or_default().last_seen_position = Some(sighting);
    }

    /// Feeds one accepted sighting. Returns the kind of crossing if the
    /// marker went over the finish line.
    pub fn observe(
        &mut self,
        id: MarkerId,
        sighting: Sighting,
        line: &FinishLine,
        config: &DetectorConfig,
    ) -> Option<CrossingKind> {
        let marker = self.markers.entry(id).or_default();
        marker.consecutive_confirmations = marker.consecutive_confirmations.saturating_add(1);
        marker.last_seen_position = Some(sighting);

        if marker.consecutive_confirmations < config.min_detection_frames {
            if !config.allow_quick_pass {
                return None;
            }

            let anchor = marker
                .confirmed_position
                .filter(|c| sighting.ts - c.ts <= config.quick_pass_time)?;

            if line.is_crossed(&anchor.center, &sighting.center) {
                marker.break_streak();
                return Some(CrossingKind::QuickPass);
            }

            return None;
        }

        let previous = marker.confirmed_position.replace(sighting)?;

        if line.is_crossed(&previous.center, &sighting.center) {
            Some(CrossingKind::Confirmed)
        } else {
            None
        }
    }

    /// Markers missing from a frame lose their partial confirmation.
    pub fn end_frame(&mut self, seen: &HashSet<MarkerId>) {
        for (id, marker) in self.markers.iter_mut() {
            if !seen.contains(id) {
                marker.break_streak();
            }
        }
    }

    pub fn forget(&mut self, id: MarkerId) {
        self.markers.remove(&id);
    }

    pub fn clear(&mut self) {
        self.markers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::TrackState;
    use nalgebra as na;

    fn line() -> FinishLine {
        FinishLine::new(na::Point2::new(0.0, 0.0), na::Point2::new(100.0, 0.0)).unwrap()
    }

    fn at(y: f32, ts: f64) -> Sighting {
        Sighting::new(na::Point2::new(50.0, y), ts)
    }

    fn config(frames: u32, quick_pass: bool) -> DetectorConfig {
        DetectorConfig {
            min_detection_frames: frames,
            allow_quick_pass: quick_pass,
            quick_pass_time: 0.5,
            ..DetectorConfig::default()
        }
    }

    #[test]
    fn first_confirmed_sighting_seeds_the_anchor() {
        let mut tracker = CrossingTracker::new();
        let cfg = config(2, false);

        assert_eq!(tracker.observe(1, at(-10.0, 0.0), &line(), &cfg), None);
        assert_eq!(
            tracker.get(1).unwrap().state(cfg.min_detection_frames),
            TrackState::Confirming
        );
        assert!(tracker.get(1).unwrap().confirmed_position.is_none());

        assert_eq!(tracker.observe(1, at(-8.0, 0.1), &line(), &cfg), None);
        let marker = tracker.get(1).unwrap();
        assert_eq!(marker.state(cfg.min_detection_frames), TrackState::Confirmed);
        assert_eq!(marker.confirmed_position, Some(at(-8.0, 0.1)));
    }

    #[test]
    fn confirmed_marker_crossing() {
        let mut tracker = CrossingTracker::new();
        let cfg = config(2, false);

        tracker.observe(1, at(-10.0, 0.0), &line(), &cfg);
        tracker.observe(1, at(-5.0, 0.1), &line(), &cfg);

        assert_eq!(
            tracker.observe(1, at(5.0, 0.2), &line(), &cfg),
            Some(CrossingKind::Confirmed)
        );
        assert_eq!(tracker.observe(1, at(10.0, 0.3), &line(), &cfg), None);
        assert_eq!(tracker.get(1).unwrap().confirmed_position, Some(at(10.0, 0.3)));
    }

    #[test]
    fn rejection_resets_a_confirmed_marker() {
        let mut tracker = CrossingTracker::new();
        let cfg = config(3, false);

        for (i, y) in [-30.0, -20.0, -10.0].into_iter().enumerate() {
            tracker.observe(1, at(y, i as f64 * 0.1), &line(), &cfg);
        }
        assert_eq!(tracker.get(1).unwrap().state(3), TrackState::Confirmed);

        tracker.reject(1);
        assert_eq!(tracker.get(1).unwrap().state(3), TrackState::Unconfirmed);

        // crossing while re-confirming goes unnoticed without quick pass
        assert_eq!(tracker.observe(1, at(10.0, 0.4), &line(), &cfg), None);
        assert_eq!(tracker.observe(1, at(12.0, 0.5), &line(), &cfg), None);
        assert_eq!(tracker.get(1).unwrap().state(3), TrackState::Confirming);
        assert_eq!(tracker.get(1).unwrap().confirmed_position, Some(at(-10.0, 0.2)));

        // confirmed again: the stale anchor is still behind the line
        assert_eq!(
            tracker.observe(1, at(14.0, 0.6), &line(), &cfg),
            Some(CrossingKind::Confirmed)
        );
    }

    #[test]
    fn quick_pass_recovers_fast_crossing() {
        let mut tracker = CrossingTracker::new();
        let cfg = config(3, true);

        for (i, y) in [-30.0, -20.0, -10.0].into_iter().enumerate() {
            tracker.observe(1, at(y, i as f64 * 0.1), &line(), &cfg);
        }

        // marker vanishes for a frame, then shows up on the other side
        tracker.end_frame(&HashSet::new());
        assert_eq!(
            tracker.observe(1, at(10.0, 0.4), &line(), &cfg),
            Some(CrossingKind::QuickPass)
        );

        let marker = tracker.get(1).unwrap();
        assert_eq!(marker.consecutive_confirmations, 0);
        assert_eq!(marker.confirmed_position, Some(at(-10.0, 0.2)));
        assert_eq!(marker.last_seen_position, Some(at(10.0, 0.4)));
    }

    #[test]
    fn quick_pass_respects_window() {
        let mut tracker = CrossingTracker::new();
        let cfg = config(2, true);

        tracker.observe(1, at(-20.0, 0.0), &line(), &cfg);
        tracker.observe(1, at(-10.0, 0.1), &line(), &cfg);
        tracker.end_frame(&HashSet::new());

        assert_eq!(tracker.observe(1, at(10.0, 1.0), &line(), &cfg), None);
    }

    #[test]
    fn absent_markers_lose_their_streak() {
        let mut tracker = CrossingTracker::new();
        let cfg = config(3, false);

        tracker.observe(1, at(-20.0, 0.0), &line(), &cfg);
        tracker.observe(2, at(-20.0, 0.0), &line(), &cfg);

        let seen: HashSet<MarkerId> = [2].into_iter().collect();
        tracker.end_frame(&seen);

        assert_eq!(tracker.get(1).unwrap().consecutive_confirmations, 0);
        assert_eq!(tracker.get(2).unwrap().consecutive_confirmations, 1);
    }

    #[test]
    fn excluded_markers_only_update_recency() {
        let mut tracker = CrossingTracker::new();

        tracker.observe_excluded(5, at(3.0, 1.0));
        let marker = tracker.get(5).unwrap();

        assert_eq!(marker.last_seen_position, Some(at(3.0, 1.0)));
        assert_eq!(marker.consecutive_confirmations, 0);
        assert!(marker.confirmed_position.is_none());
    }

    #[test]
    fn reject_of_unknown_marker_creates_nothing() {
        let mut tracker = CrossingTracker::new();
        tracker.reject(42);
        assert!(tracker.is_empty());
    }

    #[test]
    fn forget_and_clear() {
        let mut tracker = CrossingTracker::new();
        let cfg = config(1, false);

        tracker.observe(1, at(-1.0, 0.0), &line(), &cfg);
        tracker.observe(2, at(-1.0, 0.0), &line(), &cfg);

        tracker.forget(1);
        assert!(tracker.get(1).is_none());
        assert_eq!(tracker.len(), 1);

        tracker.clear();
        assert!(tracker.is_empty());
    }
}
