use crate::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Frame rates the encoder accepts.
pub const ALLOWED_FPS: [u32; 4] = [10, 15, 20, 25];

/// Palette sizes the encoder accepts.
pub const ALLOWED_COLORS: [u16; 3] = [128, 192, 256];

/// Common output widths offered to users. Any positive width is accepted.
pub const WIDTH_PRESETS: [u32; 7] = [320, 480, 640, 800, 1024, 1280, 1920];

/// Lowest and highest encode quality level.
pub const QUALITY_LEVEL_RANGE: std::ops::RangeInclusive<u8> = 1..=6;

/// Size factor used by the estimator, indexed by [`QualityPreset`].
pub const QUALITY_SIZE_FACTORS: [u8; 4] = [1, 2, 3, 4];

/// Encode quality level (1..=6) used by the plan builder, indexed by [`QualityPreset`].
pub const QUALITY_ENCODE_LEVELS: [u8; 4] = [1, 3, 5, 6];

/// User-facing quality choice.
///
/// The same choice feeds two different scales: a coarse 1..4 factor for size
/// estimation and a 1..6 level for the bayer scale of the encode pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    #[default]
    High,
    Best,
}

impl QualityPreset {
    pub fn all() -> &'static [QualityPreset] {
        &[Self::Low, Self::Medium, Self::High, Self::Best]
    }

    fn index(self) -> usize {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Best => 3,
        }
    }

    pub fn size_factor(self) -> u8 {
        QUALITY_SIZE_FACTORS[self.index()]
    }

    pub fn encode_level(self) -> u8 {
        QUALITY_ENCODE_LEVELS[self.index()]
    }
}

impl fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Best => "best",
        };
        f.write_str(name)
    }
}

impl FromStr for QualityPreset {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|p| p.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown quality '{}' (expected low, medium, high or best)", s))
    }
}

/// Dithering algorithm applied by the paletted encode pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DitherMethod {
    #[default]
    Bayer,
    FloydSteinberg,
    #[serde(rename = "sierra2_4a")]
    Sierra24a,
}

impl DitherMethod {
    pub fn all() -> &'static [DitherMethod] {
        &[Self::Bayer, Self::FloydSteinberg, Self::Sierra24a]
    }

    /// Name understood by ffmpeg's `paletteuse` filter
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bayer => "bayer",
            Self::FloydSteinberg => "floyd_steinberg",
            Self::Sierra24a => "sierra2_4a",
        }
    }
}

impl fmt::Display for DitherMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DitherMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|d| d.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown dither method '{}' (expected bayer, floyd_steinberg or sierra2_4a)", s))
    }
}

/// Parameters of one conversion attempt.
///
/// Values are never changed once a run starts. Retrying past a policy limit
/// goes through [`ConversionRequest::with_override`], which returns a new
/// request with a bumped attempt number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Seconds into the source where the clip starts
    pub start: f64,
    /// Clip length in seconds; `None` (or a non-positive value) means until the end of the source
    pub duration: Option<f64>,
    pub fps: u32,
    /// Encode quality level, 1 (smallest) to 6 (best)
    pub quality: u8,
    /// Output width in pixels; height follows the source aspect ratio
    pub width: u32,
    pub dither: DitherMethod,
    pub colors: u16,
    pub ignore_limits: bool,
    /// 1 for the first run, incremented by each override
    pub attempt: u32,
}

impl ConversionRequest {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            start: 0.0,
            duration: None,
            fps: 25,
            quality: QualityPreset::default().encode_level(),
            width: 800,
            dither: DitherMethod::default(),
            colors: 256,
            ignore_limits: false,
            attempt: 1,
        }
    }

    pub fn with_start(mut self, start: f64) -> Self {
        self.start = start;
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Convert everything from `start` to the end of the source
    pub fn with_full_duration(mut self) -> Self {
        self.duration = None;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_quality_preset(mut self, preset: QualityPreset) -> Self {
        self.quality = preset.encode_level();
        self
    }

    pub fn with_width(mut self, width: u32) -> Self {
        self.width = width;
        self
    }

    pub fn with_dither(mut self, dither: DitherMethod) -> Self {
        self.dither = dither;
        self
    }

    pub fn with_colors(mut self, colors: u16) -> Self {
        self.colors = colors;
        self
    }

    pub fn with_ignore_limits(mut self, ignore_limits: bool) -> Self {
        self.ignore_limits = ignore_limits;
        self
    }

    /// Fresh attempt of the same conversion with policy limits disabled
    pub fn with_override(&self) -> Self {
        Self {
            ignore_limits: true,
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// The explicitly requested clip length, if one was given
    pub fn requested_duration(&self) -> Option<f64> {
        self.duration.filter(|d| d.is_finite() && *d > 0.0)
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<()> {
        if self.input.as_os_str().is_empty() {
            return Err(ConvertError::invalid("input path is empty"));
        }
        if self.output.as_os_str().is_empty() {
            return Err(ConvertError::invalid("output path is empty"));
        }
        if !self.start.is_finite() || self.start < 0.0 {
            return Err(ConvertError::invalid(format!("start time must be >= 0, got {}", self.start)));
        }
        if let Some(d) = self.duration {
            if d.is_nan() {
                return Err(ConvertError::invalid("duration is not a number"));
            }
        }
        if !ALLOWED_FPS.contains(&self.fps) {
            return Err(ConvertError::invalid(format!("fps must be one of {:?}, got {}", ALLOWED_FPS, self.fps)));
        }
        if !QUALITY_LEVEL_RANGE.contains(&self.quality) {
            return Err(ConvertError::invalid(format!("quality must be within 1..=6, got {}", self.quality)));
        }
        if self.width == 0 {
            return Err(ConvertError::invalid("width must be positive"));
        }
        if !ALLOWED_COLORS.contains(&self.colors) {
            return Err(ConvertError::invalid(format!("colors must be one of {:?}, got {}", ALLOWED_COLORS, self.colors)));
        }
        Ok(())
    }
}
