//! Output size estimation.
//!
//! The size model is an empirical fit, not a physical one: it assumes a
//! fixed compression factor and scales linearly with pixel count, palette
//! size and quality. Treat the result as a rough guide.

use crate::policy::{self, Policy, Violations};
use crate::request::QualityPreset;
use serde::Serialize;

/// Calibrated divisor turning raw pixel volume into bytes
pub const COMPRESSION_FACTOR: f64 = 30_000.0;

/// Aspect ratio assumed before a source has been probed
const FALLBACK_ASPECT: (u32, u32) = (16, 9);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimateInput {
    pub duration: f64,
    pub fps: u32,
    pub width: u32,
    /// Source dimensions (width, height), if known
    pub source: Option<(u32, u32)>,
    pub quality: QualityPreset,
    pub colors: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Estimate {
    pub frame_count: u64,
    pub output_width: u32,
    pub output_height: u32,
    pub estimated_size_mb: f64,
    pub violations: Violations,
}

impl Estimate {
    pub fn within_limits(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Scaled height for `width`, following the source aspect ratio
pub fn output_height(width: u32, source: Option<(u32, u32)>) -> u32 {
    let (sw, sh) = match source {
        Some((w, h)) if w > 0 && h > 0 => (w, h),
        _ => FALLBACK_ASPECT,
    };
    (width as f64 * sh as f64 / sw as f64).round() as u32
}

/// Estimate with the default policy limits
pub fn estimate(input: &EstimateInput) -> Estimate {
    estimate_with_policy(input, &Policy::default())
}

pub fn estimate_with_policy(input: &EstimateInput, policy: &Policy) -> Estimate {
    let frame_count = policy::frame_count(input.fps, input.duration);
    let output_width = input.width;
    let output_height = output_height(input.width, input.source);

    let color_depth = input.colors as f64 / 256.0;
    let quality_factor = input.quality.size_factor() as f64;
    let bytes = frame_count as f64 * output_width as f64 * output_height as f64 * color_depth * quality_factor / COMPRESSION_FACTOR;
    let estimated_size_mb = bytes / (1024.0 * 1024.0);

    Estimate {
        frame_count,
        output_width,
        output_height,
        estimated_size_mb,
        violations: policy.violations(frame_count, estimated_size_mb),
    }
}
