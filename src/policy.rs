//! Platform output limits.
//!
//! The defaults match the WeChat official-account GIF rules (300 frames,
//! 10 MB). Both limits can be replaced through the `[policy]` section of the
//! configuration file, and both are skipped when a request sets
//! `ignore_limits`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub const DEFAULT_MAX_FRAMES: u64 = 300;
pub const DEFAULT_MAX_SIZE_MB: f64 = 10.0;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Kind of limit a conversion ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PolicyViolation {
    FrameCountExceeded,
    SizeExceeded,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameCountExceeded => f.write_str("frame count exceeded"),
            Self::SizeExceeded => f.write_str("file size exceeded"),
        }
    }
}

pub type Violations = BTreeSet<PolicyViolation>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub max_frames: u64,
    pub max_size_mb: f64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            max_size_mb: DEFAULT_MAX_SIZE_MB,
        }
    }
}

impl Policy {
    pub fn frames_exceeded(&self, frame_count: u64) -> bool {
        frame_count > self.max_frames
    }

    pub fn size_exceeded(&self, size_mb: f64) -> bool {
        size_mb > self.max_size_mb
    }

    /// All limits broken by a clip with the given frame count and size
    pub fn violations(&self, frame_count: u64, size_mb: f64) -> Violations {
        let mut out = Violations::new();
        if self.frames_exceeded(frame_count) {
            out.insert(PolicyViolation::FrameCountExceeded);
        }
        if self.size_exceeded(size_mb) {
            out.insert(PolicyViolation::SizeExceeded);
        }
        out
    }
}

/// Number of frames sampled from `duration` seconds at `fps`.
///
/// Both the estimator and the pipeline's preflight check go through this
/// function so their counts agree for the same resolved duration.
pub fn frame_count(fps: u32, duration: f64) -> u64 {
    let frames = (fps as f64 * duration).floor();
    if frames.is_finite() && frames > 0.0 {
        frames as u64
    } else {
        0
    }
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}
