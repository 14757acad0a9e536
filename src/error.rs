use std::path::PathBuf;
use thiserror::Error;

/// Failures that end a conversion run.
///
/// Policy violations are not represented here: a run that exceeds a limit
/// terminates in an awaiting-override state instead of failing.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Malformed parameters, caught before any process is spawned
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Source unreadable or without a video stream
    #[error("cannot read {}: {message}", path.display())]
    Probe { path: PathBuf, message: String },

    /// Palette pass exited with a non-zero status
    #[error("palette generation failed (exit code {})", fmt_code(*exit_code))]
    PaletteGenerationFailed { exit_code: Option<i32>, diagnostics: String },

    /// Paletted encode pass exited with a non-zero status
    #[error("GIF encoding failed (exit code {})", fmt_code(*exit_code))]
    EncodeFailed { exit_code: Option<i32>, diagnostics: String },

    /// External tool could not be started at all
    #[error("failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("conversion cancelled")]
    Cancelled,
}

impl ConvertError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    /// Captured tool output, if this error came from an external process.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::PaletteGenerationFailed { diagnostics, .. } | Self::EncodeFailed { diagnostics, .. } => Some(diagnostics),
            Self::Probe { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Stable machine-readable name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Probe { .. } => "probe_error",
            Self::PaletteGenerationFailed { .. } => "palette_generation_failed",
            Self::EncodeFailed { .. } => "encode_failed",
            Self::Spawn { .. } => "spawn_failed",
            Self::Io { .. } => "io_error",
            Self::Cancelled => "cancelled",
        }
    }
}

fn fmt_code(code: Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}

pub type Result<T, E = ConvertError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_failures_expose_diagnostics_verbatim() {
        let err = ConvertError::EncodeFailed { exit_code: Some(1), diagnostics: "line 1\nline 2\n".into() };
        assert_eq!(err.diagnostics(), Some("line 1\nline 2\n"));
        assert_eq!(err.to_string(), "GIF encoding failed (exit code 1)");
        assert_eq!(err.kind(), "encode_failed");
    }

    #[test]
    fn killed_process_has_no_exit_code() {
        let err = ConvertError::PaletteGenerationFailed { exit_code: None, diagnostics: String::new() };
        assert!(err.to_string().contains("exit code none"));
    }
}
