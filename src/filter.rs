use std::collections::HashSet;
use std::fmt;

use crate::config::DetectorConfig;
use crate::detection::MarkerObservation;
use crate::MarkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    LowConfidence,
    BitErrors,
    TooSmall,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::LowConfidence => "low confidence",
            RejectReason::BitErrors => "bit errors",
            RejectReason::TooSmall => "too small",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Implausible detection; breaks the confirmation streak.
    Reject(RejectReason),
    /// Valid detection of a marker nobody is racing with.
    NotAllowed,
}

/// Per-frame view of the thresholds and the roster restriction.
pub struct MarkerFilter<'a> {
    config: &'a DetectorConfig,
    allowed: Option<&'a HashSet<MarkerId>>,
}

impl<'a> MarkerFilter<'a> {
    pub fn new(config: &'a DetectorConfig, allowed: Option<&'a HashSet<MarkerId>>) -> Self {
        Self { config, allowed }
    }

    pub fn classify(&self, obs: &MarkerObservation) -> Verdict {
        if obs.confidence < self.config.min_decision_margin {
            return Verdict::Reject(RejectReason::LowConfidence);
        }

        if obs.bit_error > self.config.max_hamming {
            return Verdict::Reject(RejectReason::BitErrors);
        }

        if obs.area() < self.config.min_tag_area {
            return Verdict::Reject(RejectReason::TooSmall);
        }

        match self.allowed {
            Some(ids) if !ids.contains(&obs.id) => Verdict::NotAllowed,
            _ => Verdict::Accept,
        }
    }
}
