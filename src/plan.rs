use crate::error::{ConvertError, Result};
use crate::request::{ConversionRequest, QUALITY_LEVEL_RANGE};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// File name of the palette image inside a run's working directory
pub const PALETTE_FILE_NAME: &str = "palette.png";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// First pass: derive the color table
    Palette,
    /// Second pass: map frames onto the palette
    Encode,
}

/// One ffmpeg invocation. `args` excludes the program itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub kind: StepKind,
    pub args: Vec<OsString>,
    /// File this step writes
    pub artifact: PathBuf,
}

impl PlanStep {
    /// Arguments joined for logging
    pub fn display_args(&self) -> String {
        self.args.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ")
    }
}

/// Bayer pattern scale for a quality level: 1 gives 5, 6 gives 0.
pub fn bayer_scale(quality: u8) -> Result<u8> {
    if !QUALITY_LEVEL_RANGE.contains(&quality) {
        return Err(ConvertError::invalid(format!("quality must be within 1..=6, got {}", quality)));
    }
    Ok(6 - quality)
}

fn sample_filter(fps: u32, width: u32) -> String {
    format!("fps={},scale={}:-1:flags=lanczos", fps, width)
}

pub(crate) fn palette_filter(fps: u32, width: u32, colors: u16) -> String {
    format!("{},palettegen=max_colors={}:stats_mode=full", sample_filter(fps, width), colors)
}

pub(crate) fn paletteuse_filter(fps: u32, width: u32, dither: &str, bayer: u8) -> String {
    format!("{} [x]; [x][1:v] paletteuse=dither={}:bayer_scale={}", sample_filter(fps, width), dither, bayer)
}

fn window_args(args: &mut Vec<OsString>, request: &ConversionRequest, duration: f64) {
    args.push("-y".into());
    args.push("-ss".into());
    args.push(request.start.to_string().into());
    args.push("-t".into());
    args.push(duration.to_string().into());
    args.push("-i".into());
    args.push(request.input.clone().into_os_string());
}

/// Build the palette and encode steps for one run.
///
/// The palette is written into `work_dir`, which the caller owns and removes
/// after the run. The same inputs always produce identical argument vectors.
pub fn build_plan(request: &ConversionRequest, resolved_duration: f64, work_dir: &Path) -> Result<[PlanStep; 2]> {
    if !resolved_duration.is_finite() || resolved_duration <= 0.0 {
        return Err(ConvertError::invalid(format!("duration must be positive, got {}", resolved_duration)));
    }
    if request.width == 0 {
        return Err(ConvertError::invalid("width must be positive"));
    }
    let bayer = bayer_scale(request.quality)?;
    let palette = work_dir.join(PALETTE_FILE_NAME);

    let mut palette_args = Vec::with_capacity(10);
    window_args(&mut palette_args, request, resolved_duration);
    palette_args.push("-vf".into());
    palette_args.push(palette_filter(request.fps, request.width, request.colors).into());
    palette_args.push(palette.clone().into_os_string());

    let mut encode_args = Vec::with_capacity(12);
    window_args(&mut encode_args, request, resolved_duration);
    encode_args.push("-i".into());
    encode_args.push(palette.clone().into_os_string());
    encode_args.push("-lavfi".into());
    encode_args.push(paletteuse_filter(request.fps, request.width, request.dither.as_str(), bayer).into());
    encode_args.push(request.output.clone().into_os_string());

    Ok([
        PlanStep { kind: StepKind::Palette, args: palette_args, artifact: palette },
        PlanStep { kind: StepKind::Encode, args: encode_args, artifact: request.output.clone() },
    ])
}
