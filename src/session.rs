use crate::error::Result;
use crate::estimate::{estimate_with_policy, Estimate, EstimateInput};
use crate::ffmpeg::{Probe, SourceMetadata};
use crate::policy::Policy;
use crate::request::{ConversionRequest, QualityPreset};
use std::path::{Path, PathBuf};
use tracing::info;

const GIF_EXTENSION: &str = "gif";

/// Currently selected input and its probed metadata.
///
/// The metadata is probed once when an input is selected and dropped when
/// another input is selected. Runs only read it.
pub struct Session<P> {
    probe: P,
    policy: Policy,
    input: Option<PathBuf>,
    metadata: Option<SourceMetadata>,
}

impl<P: Probe> Session<P> {
    pub fn new(probe: P, policy: Policy) -> Self {
        Self {
            probe,
            policy,
            input: None,
            metadata: None,
        }
    }

    /// Select a new input and probe it. On failure nothing stays selected.
    pub fn select_input(&mut self, path: impl Into<PathBuf>) -> Result<SourceMetadata> {
        let path = path.into();
        self.clear();
        let meta = self.probe.probe(&path)?;
        info!(input = %path.display(), duration = meta.duration, width = meta.width, height = meta.height, "selected input");
        self.input = Some(path);
        self.metadata = Some(meta);
        Ok(meta)
    }

    pub fn clear(&mut self) {
        self.input = None;
        self.metadata = None;
    }

    pub fn input(&self) -> Option<&Path> {
        self.input.as_deref()
    }

    pub fn metadata(&self) -> Option<&SourceMetadata> {
        self.metadata.as_ref()
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Clip length to convert: the requested length capped at what the source
    /// has left after `start`, or the whole remainder when nothing is requested.
    pub fn clip_duration(&self, start: f64, requested: Option<f64>) -> Option<f64> {
        let remaining = self.metadata.map(|m| (m.duration - start).max(0.0));
        match (requested.filter(|d| *d > 0.0), remaining) {
            (Some(d), Some(r)) => Some(d.min(r)),
            (Some(d), None) => Some(d),
            (None, r) => r,
        }
    }

    /// Cap a request for the selected input the same way [`Session::clip_duration`]
    /// caps estimates, so a run counts the frames the estimate showed.
    ///
    /// A start at or past the end of the source drops the explicit length and
    /// leaves the run to report it. Requests for other inputs pass through.
    pub fn fit_request(&self, request: ConversionRequest) -> ConversionRequest {
        if self.input() != Some(request.input.as_path()) {
            return request;
        }
        let Some(requested) = request.requested_duration() else {
            return request;
        };
        match self.clip_duration(request.start, Some(requested)) {
            Some(d) if d > 0.0 => request.with_duration(d),
            _ => request.with_full_duration(),
        }
    }

    /// Estimate for the current parameters, using the source aspect ratio once probed
    pub fn estimate(&self, duration: f64, fps: u32, width: u32, quality: QualityPreset, colors: u16) -> Estimate {
        let input = EstimateInput {
            duration,
            fps,
            width,
            source: self.metadata.map(|m| m.dimensions()),
            quality,
            colors,
        };
        estimate_with_policy(&input, &self.policy)
    }
}

/// Make sure `path` ends in `.gif`, appending the extension otherwise
pub fn with_gif_extension(path: PathBuf) -> PathBuf {
    let is_gif = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(GIF_EXTENSION));
    if is_gif {
        return path;
    }
    let mut raw = path.into_os_string();
    raw.push(".");
    raw.push(GIF_EXTENSION);
    PathBuf::from(raw)
}

/// First free `<stem>.gif`, `<stem>_1.gif`, `<stem>_2.gif`, ... in `output_dir`
pub fn unique_output_path(output_dir: &Path, input: &Path) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let mut candidate = output_dir.join(format!("{}.{}", stem, GIF_EXTENSION));
    let mut counter = 1;
    while candidate.exists() {
        candidate = output_dir.join(format!("{}_{}.{}", stem, counter, GIF_EXTENSION));
        counter += 1;
    }
    candidate
}
