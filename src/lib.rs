//! # vid2gif - Video to GIF Conversion Library
//!
//! `vid2gif` turns a time window of a video into an animated GIF using the
//! two-pass ffmpeg approach: a palette is derived from the clip first, then
//! the frames are mapped onto it with dithering.
//!
//! ## Features
//!
//! - Size and frame-count estimation before anything is encoded
//! - Policy limits on frame count and output size, with explicit overrides
//! - Event stream of log lines, progress milestones, warnings and a final result
//! - Cancellation of in-flight runs
//! - Pluggable probe and encoder so the pipeline can run without ffmpeg
//!
//! ## Example
//!
//! ```no_run
//! use vid2gif::{ConversionRequest, Event, GifConverter, Terminal};
//!
//! let converter = GifConverter::new();
//! let request = ConversionRequest::new("clip.mp4", "clip.gif")
//!     .with_start(2.0)
//!     .with_duration(5.0)
//!     .with_fps(15)
//!     .with_width(640);
//!
//! let report = converter.convert_with_events(request, |event| match event {
//!     Event::Progress(p) => println!("{}%", p),
//!     Event::Terminal(Terminal::Completed(out)) => println!("wrote {:.2} MB", out.size_mb),
//!     _ => {}
//! });
//! println!("finished in state {:?}", report.state);
//! ```
//!
//! ## Estimating
//!
//! ```no_run
//! use vid2gif::{GifConverter, QualityPreset};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let converter = GifConverter::new();
//! let mut session = converter.session();
//! session.select_input("clip.mp4")?;
//! let duration = session.clip_duration(0.0, Some(10.0)).unwrap_or(10.0);
//! let est = session.estimate(duration, 25, 800, QualityPreset::High, 256);
//! println!("{} frames, ~{:.3} MB", est.frame_count, est.estimated_size_mb);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod estimate;
pub mod ffmpeg;
pub mod pipeline;
pub mod plan;
pub mod policy;
pub mod request;
pub mod session;

pub use config::{AppConfig, Defaults, Settings};
pub use error::{ConvertError, Result};
pub use estimate::{estimate, estimate_with_policy, Estimate, EstimateInput};
pub use ffmpeg::{Encoder, FfmpegConfig, FfmpegEncoder, FfmpegProbe, Probe, SourceMetadata, StepOutput};
pub use pipeline::{CancelToken, Event, EventSink, Pipeline, PolicyWarning, RunHandle, RunOutcome, RunReport, RunState, Terminal};
pub use policy::{Policy, PolicyViolation, Violations};
pub use request::{ConversionRequest, DitherMethod, QualityPreset};
pub use session::{unique_output_path, with_gif_extension, Session};

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Converter wired to the real ffmpeg tools
pub struct GifConverter {
    config: AppConfig,
    pipeline: Arc<Pipeline<FfmpegProbe, FfmpegEncoder>>,
}

impl GifConverter {
    /// Create a converter with default configuration
    pub fn new() -> Self {
        Self::build(AppConfig::default())
    }

    /// Create a converter with custom configuration
    pub fn with_config(config: AppConfig) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// Load configuration from a TOML file
    pub fn from_config_file(path: &Path) -> anyhow::Result<Self> {
        Ok(Self::build(AppConfig::from_file(path)?))
    }

    fn build(mut config: AppConfig) -> Self {
        config.ffmpeg = config.ffmpeg.resolve();
        let pipeline = Pipeline::with_policy(
            FfmpegProbe::new(config.ffmpeg.clone()),
            FfmpegEncoder::new(config.ffmpeg.clone()),
            config.policy,
        );
        Self { config, pipeline: Arc::new(pipeline) }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// New input session sharing this converter's tools and limits
    pub fn session(&self) -> Session<FfmpegProbe> {
        Session::new(FfmpegProbe::new(self.config.ffmpeg.clone()), self.config.policy)
    }

    /// Estimate against the configured limits
    pub fn estimate(&self, input: &EstimateInput) -> Estimate {
        estimate_with_policy(input, &self.config.policy)
    }

    /// Request for `input` with every parameter taken from the configured defaults
    pub fn request(&self, input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> ConversionRequest {
        let d = &self.config.defaults;
        let mut request = ConversionRequest::new(input, output)
            .with_start(d.start)
            .with_fps(d.fps)
            .with_width(d.width)
            .with_quality_preset(d.quality)
            .with_dither(d.dither)
            .with_colors(d.colors);
        request.duration = d.duration;
        request
    }

    /// Start a run in the background
    pub fn spawn(&self, request: ConversionRequest) -> RunHandle {
        self.pipeline.spawn(request)
    }

    /// Run to completion, passing every event to `on_event` as it arrives.
    ///
    /// The last event handed over is always an [`Event::Terminal`].
    pub fn convert_with_events<F>(&self, request: ConversionRequest, mut on_event: F) -> RunReport
    where
        F: FnMut(Event),
    {
        let handle = self.spawn(request);
        for event in handle.events().iter() {
            on_event(event);
        }
        handle.wait()
    }
}

impl Default for GifConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_follow_configured_defaults() {
        let mut cfg = AppConfig::default();
        cfg.defaults.fps = 15;
        cfg.defaults.quality = QualityPreset::Low;
        cfg.defaults.duration = None;
        let converter = GifConverter::with_config(cfg).unwrap();
        let req = converter.request("a.mp4", "a.gif");
        assert_eq!(req.fps, 15);
        assert_eq!(req.quality, 1);
        assert_eq!(req.duration, None);
        req.validate().unwrap();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.defaults.colors = 100;
        assert!(GifConverter::with_config(cfg).is_err());
    }

    #[test]
    fn estimate_uses_configured_policy() {
        let mut cfg = AppConfig::default();
        cfg.policy.max_frames = 50;
        let converter = GifConverter::with_config(cfg).unwrap();
        let est = converter.estimate(&EstimateInput {
            duration: 5.0,
            fps: 25,
            width: 640,
            source: None,
            quality: QualityPreset::High,
            colors: 256,
        });
        assert_eq!(est.frame_count, 125);
        assert!(est.violations.contains(&PolicyViolation::FrameCountExceeded));
    }
}
