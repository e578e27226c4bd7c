//! Configuration types for the voice session subsystem.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for a voice session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Amplitude analysis settings.
    pub analysis: AnalysisConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Recording settings.
    pub recording: RecordingConfig,
    /// Remote transcription/synthesis service settings.
    pub services: ServiceConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Input sample rate in Hz that captured audio is downsampled to.
    pub input_sample_rate: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            input_device: None,
            output_device: None,
        }
    }
}

/// Amplitude analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Number of recent samples the level tap keeps for RMS estimation.
    pub window_size: usize,
    /// Exponential smoothing constant applied to successive RMS readings.
    ///
    /// 0.0 disables smoothing entirely; values near 1.0 respond slowly.
    pub smoothing: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            window_size: 2048,
            smoothing: 0.8,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS threshold separating speech from silence.
    ///
    /// Readings above this value count as speech. Typical values for f32
    /// samples in \[-1, 1\]:
    ///   - 0.005: very sensitive (picks up quiet speech and some noise)
    ///   - 0.01:  normal sensitivity (default, good for most environments)
    ///   - 0.02:  reduced sensitivity (noisy environments)
    pub threshold: f32,
    /// Continuous silence in ms before a recording is auto-stopped.
    pub silence_hold_ms: u64,
    /// Interval in ms between level samples while recording.
    pub poll_interval_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            silence_hold_ms: 1500,
            poll_interval_ms: 16,
        }
    }
}

/// Recording configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Cadence in ms at which the capture handle delivers chunks.
    pub chunk_interval_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            chunk_interval_ms: 200,
        }
    }
}

/// Remote speech service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL of the assistant backend hosting `/transcribe` and `/synthesize`.
    pub base_url: String,
    /// Optional language hint forwarded to the transcription service.
    pub language: Option<String>,
    /// Voice name requested from the synthesis service.
    pub voice: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_owned(),
            language: None,
            voice: "alloy".to_owned(),
            request_timeout_secs: 30,
        }
    }
}

impl VoiceConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::VoiceError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/lectern/voice.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("lectern").join("voice.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("lectern")
                .join("voice.toml")
        } else {
            PathBuf::from("/tmp/lectern-config/voice.toml")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_preserve_original_constants() {
        let config = VoiceConfig::default();
        assert!((config.vad.threshold - 0.01).abs() < f32::EPSILON);
        assert_eq!(config.vad.silence_hold_ms, 1500);
        assert_eq!(config.analysis.window_size, 2048);
        assert!((config.analysis.smoothing - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.recording.chunk_interval_ms, 200);
    }

    #[test]
    fn config_serializes_to_toml() {
        let config = VoiceConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialization should succeed");
        assert!(toml_str.contains("input_sample_rate"));
        assert!(toml_str.contains("threshold"));
        assert!(toml_str.contains("silence_hold_ms"));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = VoiceConfig::default();
        config.vad.threshold = 0.02;
        config.services.language = Some("zh".to_owned());
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let loaded: VoiceConfig = toml::from_str(&toml_str).expect("parse");
        assert!((loaded.vad.threshold - 0.02).abs() < f32::EPSILON);
        assert_eq!(loaded.services.language.as_deref(), Some("zh"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: VoiceConfig = toml::from_str(
            r#"
            [vad]
            threshold = 0.05
            "#,
        )
        .expect("parse");
        assert!((config.vad.threshold - 0.05).abs() < f32::EPSILON);
        assert_eq!(config.vad.silence_hold_ms, 1500);
        assert_eq!(config.audio.input_sample_rate, 16_000);
    }

    #[test]
    fn default_config_path_ends_with_voice_toml() {
        let path = VoiceConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("voice.toml"));
        assert!(path_str.contains("lectern"));
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("voice.toml");
        let mut config = VoiceConfig::default();
        config.services.base_url = "http://localhost:9999".to_owned();
        config.save_to_file(&path).expect("save");
        let loaded = VoiceConfig::from_file(&path).expect("load");
        assert_eq!(loaded.services.base_url, "http://localhost:9999");
    }
}
