//! ffmpeg and ffprobe adapters.
//!
//! The pipeline only talks to the [`Probe`] and [`Encoder`] traits. The
//! implementations here run the real tools with paths taken from an
//! [`FfmpegConfig`] that is resolved once at startup.

use crate::error::{ConvertError, Result};
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};

#[cfg(target_os = "windows")]
const FFMPEG_NAME: &str = "ffmpeg.exe";
#[cfg(target_os = "windows")]
const FFPROBE_NAME: &str = "ffprobe.exe";

#[cfg(not(target_os = "windows"))]
const FFMPEG_NAME: &str = "ffmpeg";
#[cfg(not(target_os = "windows"))]
const FFPROBE_NAME: &str = "ffprobe";

#[cfg(target_os = "windows")]
const PLATFORM_DIR: &str = "windows";
#[cfg(target_os = "macos")]
const PLATFORM_DIR: &str = "mac";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const PLATFORM_DIR: &str = "linux";

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Where to find the external tools and how to launch them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FfmpegConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    /// Launch tools without a console window (Windows only)
    pub hide_console: bool,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            hide_console: cfg!(target_os = "windows"),
        }
    }
}

impl FfmpegConfig {
    pub fn ffmpeg_cmd(&self) -> &OsStr {
        self.ffmpeg_path.as_deref().map(Path::as_os_str).unwrap_or_else(|| OsStr::new(FFMPEG_NAME))
    }

    pub fn ffprobe_cmd(&self) -> &OsStr {
        self.ffprobe_path.as_deref().map(Path::as_os_str).unwrap_or_else(|| OsStr::new(FFPROBE_NAME))
    }

    /// Fill in unset tool paths with binaries bundled next to the executable.
    ///
    /// Looks in `lib/<platform>/` beside the running binary; anything not
    /// found there is left unset so the tool is looked up on `PATH`.
    pub fn resolve(mut self) -> Self {
        let bundled = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("lib").join(PLATFORM_DIR)));
        if let Some(dir) = bundled {
            if self.ffmpeg_path.is_none() {
                self.ffmpeg_path = existing(dir.join(FFMPEG_NAME));
            }
            if self.ffprobe_path.is_none() {
                self.ffprobe_path = existing(dir.join(FFPROBE_NAME));
            }
        }
        debug!(ffmpeg = ?self.ffmpeg_cmd(), ffprobe = ?self.ffprobe_cmd(), "resolved tool paths");
        self
    }

    fn command(&self, program: &OsStr) -> Command {
        #[allow(unused_mut)]
        let mut cmd = Command::new(program);
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            if self.hide_console {
                cmd.creation_flags(CREATE_NO_WINDOW);
            }
        }
        cmd
    }
}

fn existing(path: PathBuf) -> Option<PathBuf> {
    path.is_file().then_some(path)
}

/// Duration and frame size of a source video
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Seconds
    pub duration: f64,
    pub width: u32,
    pub height: u32,
}

impl SourceMetadata {
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Reads duration and dimensions of a media file
pub trait Probe: Send + Sync {
    fn probe(&self, path: &Path) -> Result<SourceMetadata>;
}

/// Result of one external encode invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    /// Everything the tool wrote to its diagnostic stream
    pub diagnostics: String,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs one encode command, reporting each diagnostic line as it arrives
pub trait Encoder: Send + Sync {
    fn run_step(&self, args: &[OsString], on_line: &mut dyn FnMut(&str)) -> Result<StepOutput>;
}

impl<T: Probe + ?Sized> Probe for std::sync::Arc<T> {
    fn probe(&self, path: &Path) -> Result<SourceMetadata> {
        (**self).probe(path)
    }
}

impl<T: Encoder + ?Sized> Encoder for std::sync::Arc<T> {
    fn run_step(&self, args: &[OsString], on_line: &mut dyn FnMut(&str)) -> Result<StepOutput> {
        (**self).run_step(args, on_line)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Parse `ffprobe -of json` output into metadata.
pub(crate) fn parse_probe_json(path: &Path, json: &str) -> Result<SourceMetadata> {
    let probe_err = |message: String| ConvertError::Probe { path: path.to_path_buf(), message };
    let parsed: ProbeOutput = serde_json::from_str(json).map_err(|e| probe_err(format!("unreadable ffprobe output: {}", e)))?;

    let stream = parsed.streams.first().ok_or_else(|| probe_err("no video stream found".to_string()))?;
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(probe_err("video stream has no frame size".to_string())),
    };

    // Container duration first, stream duration as a fallback
    let duration = parsed
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(stream.duration.as_deref())
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
        .ok_or_else(|| probe_err("could not determine duration".to_string()))?;

    Ok(SourceMetadata { duration, width, height })
}

/// [`Probe`] backed by ffprobe
#[derive(Debug, Clone)]
pub struct FfmpegProbe {
    config: FfmpegConfig,
}

impl FfmpegProbe {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }
}

impl Probe for FfmpegProbe {
    fn probe(&self, path: &Path) -> Result<SourceMetadata> {
        let program = self.config.ffprobe_cmd();
        let output = self
            .config
            .command(program)
            .args(["-v", "error", "-select_streams", "v:0", "-show_entries", "stream=width,height,duration:format=duration", "-of", "json"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| ConvertError::Spawn { program: PathBuf::from(program), source })?;

        if !output.status.success() {
            return Err(ConvertError::Probe {
                path: path.to_path_buf(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let meta = parse_probe_json(path, &String::from_utf8_lossy(&output.stdout))?;
        info!(path = %path.display(), duration = meta.duration, width = meta.width, height = meta.height, "probed source");
        Ok(meta)
    }
}

/// Read `reader` to the end, passing each non-empty line to `on_line` and
/// appending it to `diagnostics`.
fn drain_lines<R: BufRead>(mut reader: R, on_line: &mut dyn FnMut(&str), diagnostics: &mut String) -> std::io::Result<()> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        let chunk = String::from_utf8_lossy(&buf);
        // ffmpeg rewrites its status line with carriage returns
        for line in chunk.split(['\r', '\n']).filter(|l| !l.trim().is_empty()) {
            on_line(line);
            diagnostics.push_str(line);
            diagnostics.push('\n');
        }
    }
}

/// [`Encoder`] backed by ffmpeg.
///
/// stdout is discarded and stderr is read on the calling thread until the
/// process closes it, so the child never blocks on a full pipe.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    config: FfmpegConfig,
}

impl FfmpegEncoder {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }
}

impl Encoder for FfmpegEncoder {
    fn run_step(&self, args: &[OsString], on_line: &mut dyn FnMut(&str)) -> Result<StepOutput> {
        let program = self.config.ffmpeg_cmd();
        let mut child = self
            .config
            .command(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ConvertError::Spawn { program: PathBuf::from(program), source })?;

        let stderr = child.stderr.take().ok_or_else(|| ConvertError::Io {
            context: "capturing ffmpeg stderr".into(),
            source: std::io::Error::other("stderr not piped"),
        })?;

        let mut diagnostics = String::new();
        if let Err(e) = drain_lines(BufReader::new(stderr), on_line, &mut diagnostics) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ConvertError::io("reading ffmpeg output", e));
        }

        let status = child.wait().map_err(|e| ConvertError::io("waiting for ffmpeg", e))?;
        Ok(StepOutput { exit_code: status.code(), diagnostics })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stream_and_format() {
        let json = r#"{
            "programs": [],
            "streams": [{"width": 1920, "height": 1080, "duration": "7.960000"}],
            "format": {"duration": "8.000000"}
        }"#;
        let meta = parse_probe_json(Path::new("a.mp4"), json).unwrap();
        assert_eq!(meta, SourceMetadata { duration: 8.0, width: 1920, height: 1080 });
    }

    #[test]
    fn falls_back_to_stream_duration() {
        let json = r#"{"streams": [{"width": 640, "height": 360, "duration": "3.5"}], "format": {}}"#;
        let meta = parse_probe_json(Path::new("a.webm"), json).unwrap();
        assert_eq!(meta.duration, 3.5);
    }

    #[test]
    fn missing_video_stream_is_an_error() {
        let json = r#"{"streams": [], "format": {"duration": "12.0"}}"#;
        let err = parse_probe_json(Path::new("audio.mp3"), json).unwrap_err();
        assert!(matches!(err, ConvertError::Probe { .. }));
        assert!(err.to_string().contains("no video stream"));
    }

    #[test]
    fn garbage_output_is_an_error() {
        assert!(matches!(parse_probe_json(Path::new("x"), "not json"), Err(ConvertError::Probe { .. })));
        let no_duration = r#"{"streams": [{"width": 10, "height": 10}], "format": {"duration": "N/A"}}"#;
        assert!(parse_probe_json(Path::new("x"), no_duration).is_err());
    }

    #[test]
    fn splits_carriage_return_status_lines() {
        let input: &[u8] = b"Input #0, mov\nframe=  10 fps=0.0\rframe=  20 fps=0.0\r\n\nvideo:12kB\n";
        let mut lines = Vec::new();
        let mut diagnostics = String::new();
        drain_lines(input, &mut |l| lines.push(l.to_string()), &mut diagnostics).unwrap();
        assert_eq!(lines, vec!["Input #0, mov", "frame=  10 fps=0.0", "frame=  20 fps=0.0", "video:12kB"]);
        assert_eq!(diagnostics, "Input #0, mov\nframe=  10 fps=0.0\nframe=  20 fps=0.0\nvideo:12kB\n");
    }

    struct BrokenPipe;

    impl std::io::Read for BrokenPipe {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"))
        }
    }

    #[test]
    fn read_errors_are_returned() {
        let mut diagnostics = String::new();
        let err = drain_lines(BufReader::new(BrokenPipe), &mut |_| {}, &mut diagnostics).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn explicit_paths_win() {
        let cfg = FfmpegConfig { ffmpeg_path: Some(PathBuf::from("/opt/ff/ffmpeg")), ..FfmpegConfig::default() };
        assert_eq!(cfg.ffmpeg_cmd(), OsStr::new("/opt/ff/ffmpeg"));
        assert_eq!(cfg.ffprobe_cmd(), OsStr::new(FFPROBE_NAME));
    }
}
