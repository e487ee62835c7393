//! Configuration storage

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::h264::nal::DEFAULT_OUTPUT_PADDING_SIZE;

/// Application configuration
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub depacketizer: DepacketizerConfig,
}

/// Depacketizer policy and key frame request timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepacketizerConfig {
    /// Output fragmented NAL units interrupted by packet loss (with the
    /// forbidden_zero_bit set) instead of discarding them. Decoders such as
    /// FFmpeg's can still make use of them; dropping a partial IDR makes
    /// everything up to the next key frame useless.
    pub output_incomplete_nal_units: bool,
    /// Zero bytes appended after each output NAL unit.
    pub output_padding_size: usize,
    /// Frames between two key frames produced by the remote encoder.
    pub encoder_keyframe_interval: u32,
    /// Frame rate of the remote encoder.
    pub encoder_frame_rate: u32,
    /// Minimum time between two key frame requests, in milliseconds.
    pub min_request_interval_ms: u64,
}

impl Default for DepacketizerConfig {
    fn default() -> Self {
        Self {
            output_incomplete_nal_units: true,
            output_padding_size: DEFAULT_OUTPUT_PADDING_SIZE,
            encoder_keyframe_interval: 150,
            encoder_frame_rate: 15,
            min_request_interval_ms: 500,
        }
    }
}

impl DepacketizerConfig {
    /// Time after the last key frame before one is requested: the encoder's
    /// key frame interval plus a third of it as leeway, so a perfectly
    /// transmitted stream never triggers requests.
    pub fn key_frame_grace(&self) -> Duration {
        let frame_rate = u64::from(self.encoder_frame_rate.max(1));
        let keyint = u64::from(self.encoder_keyframe_interval);
        Duration::from_millis(((keyint * 4) / (frame_rate * 3)) * 1000)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.encoder_frame_rate == 0 {
            bail!("encoder_frame_rate must be greater than zero");
        }
        Ok(())
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "h264-depay", "h264-depay")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, falling back to defaults if it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        config.depacketizer.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        fs::write(path, self.to_toml()?).context("Failed to write config file")?;
        Ok(())
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
