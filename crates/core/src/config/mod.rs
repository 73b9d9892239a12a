use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{BridgeError, Result};

/// Top-level configuration structure for a bridge instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub audio: AudioConfig,
    pub samples: SampleConfig,
    pub scope: ScopeConfig,
}

impl BridgeConfig {
    /// Parses a TOML document. Missing sections and fields take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.block_size == 0 {
            return Err(BridgeError::Config("audio.block_size must be positive".into()));
        }
        if audio.channels == 0 {
            return Err(BridgeError::Config("audio.channels must be positive".into()));
        }
        if audio.sample_rate == 0 {
            return Err(BridgeError::Config("audio.sample_rate must be positive".into()));
        }
        if audio.report_interval_blocks == 0 {
            return Err(BridgeError::Config(
                "audio.report_interval_blocks must be positive".into(),
            ));
        }
        if self.scope.fps == 0 {
            return Err(BridgeError::Config("scope.fps must be positive".into()));
        }
        if self.scope.snapshot_capacity == 0
            || self.scope.snapshot_capacity % audio.channels != 0
        {
            return Err(BridgeError::Config(format!(
                "scope.snapshot_capacity ({}) must be a positive multiple of audio.channels ({})",
                self.scope.snapshot_capacity, audio.channels
            )));
        }
        Ok(())
    }
}

/// Configuration for the render thread and its engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Frames per render block.
    pub block_size: usize,
    pub channels: usize,
    pub max_voices: usize,
    /// Blocks between visualization snapshots and clock ticks.
    pub report_interval_blocks: u32,
    pub clock_enabled: bool,
    /// Blocks rendered after a hush before the thread suspends.
    pub hush_flush_blocks: u32,
}

impl AudioConfig {
    /// Interleaved samples in one block.
    pub fn block_len(&self) -> usize {
        self.block_size * self.channels
    }

    /// Seconds of audio covered by one report interval.
    pub fn report_interval_secs(&self) -> f64 {
        (self.block_size as f64 * self.report_interval_blocks as f64) / self.sample_rate as f64
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            block_size: 128,
            channels: 2,
            max_voices: 32,
            report_interval_blocks: 8,
            clock_enabled: true,
            hush_flush_blocks: 64,
        }
    }
}

/// Configuration for sample resolution and the shared pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    pub base_url: Option<String>,
    /// Pitch assumed for every decoded sample, in Hz.
    pub root_frequency: f64,
    /// Pool size in floats.
    pub pool_capacity: usize,
    pub fetch_timeout_secs: u64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            root_frequency: 65.406,
            pool_capacity: 4_194_304,
            fetch_timeout_secs: 30,
        }
    }
}

/// Configuration for the waveform capture and its draw loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Interleaved samples held by each snapshot.
    pub snapshot_capacity: usize,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            fps: 60,
            width: 800,
            height: 200,
            snapshot_capacity: 6400,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fill_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
            [audio]
            sample_rate = 44100

            [samples]
            base_url = "https://example.org/samples/"
            "#,
        )
        .unwrap();

        assert_eq!(config.audio.sample_rate, 44_100);
        assert_eq!(config.audio.block_size, 128);
        assert_eq!(
            config.samples.base_url.as_deref(),
            Some("https://example.org/samples/")
        );
        assert_eq!(config.scope, ScopeConfig::default());
    }

    #[test]
    fn rejects_snapshot_capacity_not_aligned_to_channels() {
        let err = BridgeConfig::from_toml_str(
            r#"
            [audio]
            channels = 3

            [scope]
            snapshot_capacity = 100
            "#,
        )
        .unwrap_err();

        assert!(format!("{err}").contains("snapshot_capacity"));
    }

    #[test]
    fn report_interval_matches_block_math() {
        let audio = AudioConfig {
            sample_rate: 1_000,
            block_size: 10,
            report_interval_blocks: 5,
            ..AudioConfig::default()
        };
        assert!((audio.report_interval_secs() - 0.05).abs() < 1e-12);
        assert_eq!(audio.block_len(), 20);
    }
}
