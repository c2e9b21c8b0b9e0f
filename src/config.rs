use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::audio::{OutputFormat, PcmFormat};
use crate::load::LoadLimits;

/// Default config file (any extension supported by the `config` crate)
pub const DEFAULT_CONFIG_PATH: &str = "config/loqa-tracks";

/// Environment overrides, e.g. `LOQA_TRACKS_AUDIO__FORMAT=flac`
pub const ENV_PREFIX: &str = "LOQA_TRACKS";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioConfig,
    pub encoder: EncoderConfig,
    pub session: SessionSettings,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u64,
    pub format: OutputFormat,
    pub bitrate_kbps: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            frame_duration_ms: 20, // One codec frame
            format: OutputFormat::Opus,
            bitrate_kbps: 96,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Encoder executable, resolved on PATH
    pub program: String,
    /// Argument template replacing the built-in ffmpeg arguments
    ///
    /// Placeholders: `{sample_rate}`, `{channels}`, `{sample_format}`,
    /// `{codec}`, `{bitrate}`, `{output}`.
    pub args: Option<Vec<String>>,
    /// How long a closing encoder may take to flush before it is killed
    pub close_grace_ms: u64,
    /// Outputs smaller than this are treated as header-only and deleted
    pub min_output_bytes: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            args: None,
            close_grace_ms: 5000,
            min_output_bytes: 1024,
        }
    }
}

impl EncoderConfig {
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub ready_timeout_ms: u64,
    pub reconnect_timeout_ms: u64,
    pub reconnect_attempts: u32,
    pub stop_poll_interval_ms: u64,
    /// Live sources end after this much trailing silence
    pub trailing_silence_ms: u64,
    /// Stop once the last human participant leaves
    pub auto_stop_when_empty: bool,
    /// Marker file name inside the session directory that requests a stop
    pub stop_marker: String,
    /// Refuse to start above this CPU use; 100 or more disables the check
    pub max_cpu_percent: f32,
    /// Refuse to start above this memory use; 100 or more disables the check
    pub max_memory_percent: f32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 20_000,
            reconnect_timeout_ms: 5_000,
            reconnect_attempts: 3,
            stop_poll_interval_ms: 1_000,
            trailing_silence_ms: 1_000,
            auto_stop_when_empty: false,
            stop_marker: ".stop-requested".to_string(),
            max_cpu_percent: 80.0,
            max_memory_percent: 85.0,
        }
    }
}

impl SessionSettings {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms.max(1))
    }

    pub fn trailing_silence(&self) -> Duration {
        Duration::from_millis(self.trailing_silence_ms)
    }

    pub fn load_limits(&self) -> LoadLimits {
        LoadLimits {
            max_cpu_percent: self.max_cpu_percent,
            max_memory_percent: self.max_memory_percent,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory holding one record per recorded call
    pub dir: Option<PathBuf>,
    /// How long a remote stop waits for the owner to clear its record
    pub remote_stop_timeout_ms: u64,
    /// How long each termination signal is given before escalating
    pub terminate_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            dir: None,
            remote_stop_timeout_ms: 15_000,
            terminate_timeout_ms: 3_000,
        }
    }
}

impl RegistryConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(crate::registry::SessionRegistry::default_dir)
    }
}

impl Config {
    /// Load from an optional file layered under environment variables
    ///
    /// A missing default file is fine; an explicitly named one must exist.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = config::File::with_name(path.unwrap_or(DEFAULT_CONFIG_PATH)).required(path.is_some());

        let settings = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            bail!(
                "Invalid PCM format: {}Hz, {} channels",
                self.audio.sample_rate,
                self.audio.channels
            );
        }
        if self.audio.frame_duration_ms == 0 {
            bail!("Frame duration must be positive");
        }
        if self.encoder.program.trim().is_empty() {
            bail!("Encoder program is not set");
        }
        Ok(())
    }

    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat::new(self.audio.sample_rate, self.audio.channels)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.audio.frame_duration_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.audio.sample_rate, 48000);
        assert_eq!(cfg.audio.frame_duration_ms, 20);
        assert_eq!(cfg.encoder.program, "ffmpeg");
        assert_eq!(cfg.session.stop_marker, ".stop-requested");
        assert_eq!(cfg.frame_duration(), Duration::from_millis(20));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tracks.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[audio]\nformat = \"flac\"\nbitrate_kbps = 256").unwrap();
        writeln!(file, "[session]\nauto_stop_when_empty = true").unwrap();

        let cfg = Config::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(cfg.audio.format, OutputFormat::Flac);
        assert_eq!(cfg.audio.bitrate_kbps, 256);
        assert_eq!(cfg.audio.channels, 2);
        assert!(cfg.session.auto_stop_when_empty);
        assert_eq!(cfg.session.ready_timeout_ms, 20_000);
    }

    #[test]
    fn test_explicit_missing_file_fails() {
        assert!(Config::load(Some("/nonexistent/loqa-tracks.toml")).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let mut cfg = Config::default();
        cfg.audio.sample_rate = 0;
        assert!(cfg.validate().is_err());
    }
}
