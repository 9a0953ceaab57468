//! Pipeline configuration
//!
//! Defaults are compiled in; a TOML file in the platform config directory
//! (or the path in `VOICE_PIPELINE_CONFIG`) overrides them.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "VOICE_PIPELINE_CONFIG";

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub analysis: AnalysisConfig,
}

/// Microphone capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Input device name, `None` for the system default
    pub device: Option<String>,
    pub sample_rate: u32,
    pub frame_duration_ms: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_duration_ms: DEFAULT_FRAME_SIZE_MS,
        }
    }
}

impl CaptureConfig {
    /// Number of mono samples in one frame
    pub fn frame_samples(&self) -> usize {
        frame_samples(self.sample_rate, Duration::from_secs_f32(self.frame_duration_ms.max(0.0) / 1000.0))
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f32(self.frame_duration_ms.max(0.0) / 1000.0)
    }

    pub fn validate(&self) -> Result<()> {
        validate_sample_rate(self.sample_rate)?;
        if self.frame_duration_ms > MAX_FRAME_SIZE_MS {
            return Err(Error::Config(format!(
                "frame duration {} ms exceeds {} ms",
                self.frame_duration_ms, MAX_FRAME_SIZE_MS
            )));
        }
        if !self.frame_duration_ms.is_finite() || self.frame_samples() == 0 {
            return Err(Error::Config(format!(
                "frame duration {} ms yields no samples at {} Hz",
                self.frame_duration_ms, self.sample_rate
            )));
        }
        Ok(())
    }
}

/// Speaker playback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output device name, `None` for the system default
    pub device: Option<String>,
    pub sample_rate: u32,
    /// Silence a starved track tolerates before it is considered drained
    pub drain_grace_ms: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            drain_grace_ms: DEFAULT_DRAIN_GRACE_MS,
        }
    }
}

impl PlaybackConfig {
    /// Drain grace period in samples
    pub fn drain_grace_samples(&self) -> u64 {
        self.sample_rate as u64 * self.drain_grace_ms as u64 / 1000
    }

    pub fn validate(&self) -> Result<()> {
        validate_sample_rate(self.sample_rate)
    }
}

/// Visualization analysis settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub fft_size: usize,
    pub smoothing: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            fft_size: DEFAULT_FFT_SIZE,
            smoothing: DEFAULT_SMOOTHING,
            min_decibels: DEFAULT_MIN_DECIBELS,
            max_decibels: DEFAULT_MAX_DECIBELS,
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<()> {
        if self.fft_size < 32 || !self.fft_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "fft size {} must be a power of 2 and at least 32",
                self.fft_size
            )));
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(Error::Config(format!("smoothing {} outside [0, 1)", self.smoothing)));
        }
        if !(self.min_decibels < self.max_decibels) {
            return Err(Error::Config(format!(
                "decibel range [{}, {}] is empty",
                self.min_decibels, self.max_decibels
            )));
        }
        Ok(())
    }
}

impl PipelineConfig {
    /// Load from `VOICE_PIPELINE_CONFIG`, then the platform config file,
    /// falling back to defaults when neither exists.
    pub fn load() -> Result<Self> {
        let path = match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) => Some(PathBuf::from(path)),
            None => default_config_path().filter(|p| p.exists()),
        };

        match path {
            Some(path) => {
                tracing::info!("Loading config from {}", path.display());
                Self::load_from(&path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.capture.validate()?;
        self.playback.validate()?;
        self.analysis.validate()
    }
}

/// `<config dir>/voice-pipeline/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "voice-pipeline").map(|dirs| dirs.config_dir().join("config.toml"))
}

pub fn validate_sample_rate(sample_rate: u32) -> Result<()> {
    if (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "sample rate {} Hz outside {}..={} Hz",
            sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
        )))
    }
}

/// Samples per frame for a rate and duration, rounded to nearest
pub fn frame_samples(sample_rate: u32, duration: Duration) -> usize {
    (sample_rate as f64 * duration.as_secs_f64()).round() as usize
}
