use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceBridgeError};
use crate::logging::LoggingConfig;
use crate::vad::VadConfig;

/// Voice bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceBridgeConfig {
    /// Session registry settings
    pub sessions: SessionConfig,

    /// TTS playback settings
    pub playback: PlaybackConfig,

    /// Conversation coordinator settings
    pub coordinator: CoordinatorConfig,

    /// Voice activity detection settings
    pub vad: VadConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Session registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions older than this (seconds) are removed by the cleanup sweep
    pub max_session_age: u64,

    /// Interval between cleanup sweeps (seconds)
    pub cleanup_interval: u64,
}

/// TTS playback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Directory where transient playback audio is written for the bridge
    pub media_dir: PathBuf,

    /// Extension of transient audio files (the bridge picks the format by extension)
    pub file_extension: String,

    /// Delay before a finished playback's file is deleted (milliseconds)
    pub cleanup_delay_ms: u64,

    /// Dispatch through the session's bridge with an explicit playback id
    /// when the session has a bridge id
    pub use_bridge_media: bool,
}

/// Conversation coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Default delay before the capture fallback force-enables audio capture (milliseconds)
    pub capture_fallback_ms: u64,

    /// Only let a fallback timer act on the gating episode it was scheduled for
    pub fallback_per_episode: bool,
}

impl VoiceBridgeConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        if self.sessions.cleanup_interval == 0 {
            return Err(VoiceBridgeError::config("cleanup_interval must be greater than 0"));
        }

        if self.playback.file_extension.is_empty() {
            return Err(VoiceBridgeError::config("file_extension cannot be empty"));
        }

        if self.playback.file_extension.contains(['/', '\\', '.']) {
            return Err(VoiceBridgeError::config(format!(
                "file_extension must be a bare extension, got {:?}",
                self.playback.file_extension
            )));
        }

        if self.coordinator.capture_fallback_ms == 0 {
            return Err(VoiceBridgeError::config("capture_fallback_ms must be greater than 0"));
        }

        if self.coordinator.capture_fallback_ms > 300_000 {
            return Err(VoiceBridgeError::config("capture_fallback_ms cannot exceed 300000ms (5 minutes)"));
        }

        self.logging.validate()?;

        self.vad.validate()
    }
}

impl SessionConfig {
    pub fn max_session_age(&self) -> Duration {
        Duration::from_secs(self.max_session_age)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }
}

impl PlaybackConfig {
    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }
}

impl CoordinatorConfig {
    pub fn capture_fallback(&self) -> Duration {
        Duration::from_millis(self.capture_fallback_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_session_age: 3600, // 1 hour
            cleanup_interval: 60,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            media_dir: std::env::temp_dir().join("voice-bridge-media"),
            file_extension: "ulaw".to_string(),
            cleanup_delay_ms: 0,
            use_bridge_media: false,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            capture_fallback_ms: 5000,
            fallback_per_episode: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;

    #[test]
    fn test_default_config_is_valid() {
        let config = VoiceBridgeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sessions.max_session_age(), Duration::from_secs(3600));
        assert_eq!(config.coordinator.capture_fallback(), Duration::from_millis(5000));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = VoiceBridgeConfig::from_toml_str(
            r#"
            [playback]
            media_dir = "/var/spool/voice-bridge"
            file_extension = "sln16"

            [vad]
            min_speech_frames = 2

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.playback.media_dir, PathBuf::from("/var/spool/voice-bridge"));
        assert_eq!(config.playback.file_extension, "sln16");
        assert_eq!(config.vad.min_speech_frames, 2);
        assert_eq!(config.vad.max_silence_frames, VadConfig::default().max_silence_frames);
        assert_eq!(config.sessions.cleanup_interval, 60);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = VoiceBridgeConfig::default();
        config.coordinator.capture_fallback_ms = 0;
        assert!(matches!(config.validate(), Err(VoiceBridgeError::Config(_))));

        let mut config = VoiceBridgeConfig::default();
        config.playback.file_extension = "../wav".to_string();
        assert!(config.validate().is_err());

        let mut config = VoiceBridgeConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        assert!(VoiceBridgeConfig::from_toml_str("[vad]\nmin_speech_frames = 0\n").is_err());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = VoiceBridgeConfig::from_toml_str("[sessions\nmax_session_age = 1").unwrap_err();
        assert!(matches!(err, VoiceBridgeError::ConfigParse(_)));
    }
}
