use crate::ffmpeg::FfmpegConfig;
use crate::policy::Policy;
use crate::request::{DitherMethod, QualityPreset, ALLOWED_COLORS, ALLOWED_FPS};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const APP_DIR: &str = "vid2gif";
pub const CONFIG_FILE: &str = "vid2gif.toml";
pub const SETTINGS_FILE: &str = "settings.json";

/// Parameter values used when the command line leaves them out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub start: f64,
    /// Clip length in seconds; unset converts to the end of the source
    pub duration: Option<f64>,
    pub fps: u32,
    pub width: u32,
    pub quality: QualityPreset,
    pub dither: DitherMethod,
    pub colors: u16,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            start: 0.0,
            duration: Some(5.0),
            fps: 25,
            width: 800,
            quality: QualityPreset::High,
            dither: DitherMethod::Bayer,
            colors: 256,
        }
    }
}

/// Tool locations, output limits and parameter defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ffmpeg: FfmpegConfig,
    pub policy: Policy,
    pub defaults: Defaults,
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        let cfg: AppConfig = toml::from_str(text).context("parsing config toml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in config file {}", path.display()))
    }

    /// Look for vid2gif.toml in the user config directory, then the current
    /// directory, then fall back to built-in defaults.
    pub fn load() -> Result<Self> {
        let mut tried: Vec<PathBuf> = Vec::new();
        if let Some(mut d) = dirs::config_dir() {
            d.push(APP_DIR);
            d.push(CONFIG_FILE);
            tried.push(d);
        }
        tried.push(PathBuf::from(CONFIG_FILE));

        for p in &tried {
            if p.exists() {
                return Self::from_file(p);
            }
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        if self.policy.max_frames == 0 {
            return Err(anyhow!("policy.max_frames must be positive"));
        }
        if !(self.policy.max_size_mb.is_finite() && self.policy.max_size_mb > 0.0) {
            return Err(anyhow!("policy.max_size_mb must be a positive number"));
        }
        if !ALLOWED_FPS.contains(&self.defaults.fps) {
            return Err(anyhow!("defaults.fps must be one of {:?}", ALLOWED_FPS));
        }
        if !ALLOWED_COLORS.contains(&self.defaults.colors) {
            return Err(anyhow!("defaults.colors must be one of {:?}", ALLOWED_COLORS));
        }
        if self.defaults.width == 0 {
            return Err(anyhow!("defaults.width must be positive"));
        }
        Ok(())
    }
}

/// User preferences remembered between runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub ask_save_location: bool,
}

fn default_output_dir() -> PathBuf {
    dirs::download_dir().or_else(dirs::home_dir).unwrap_or_else(|| PathBuf::from("."))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            ask_save_location: false,
        }
    }
}

impl Settings {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR).join(SETTINGS_FILE))
    }

    /// Read settings, falling back to defaults when the file does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).with_context(|| format!("reading settings {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing settings {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self).context("serializing settings")?;
        fs::write(path, text).with_context(|| format!("writing settings {}", path.display()))
    }
}
