use thiserror::Error;

/// Voice bridge errors
///
/// Not-found and dispatch-failure conditions never surface through this type:
/// the session, playback and coordinator APIs report those as `bool`/`Option`.
/// This enum covers configuration, I/O and collaborator failures.
#[derive(Error, Debug)]
pub enum VoiceBridgeError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O errors (configuration files, transient media files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bridge collaborator errors
    #[error("Bridge error: {0}")]
    Bridge(String),
}

impl VoiceBridgeError {
    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new Bridge error
    pub fn bridge<S: Into<String>>(msg: S) -> Self {
        Self::Bridge(msg.into())
    }
}

/// Result type for voice bridge operations
pub type Result<T> = std::result::Result<T, VoiceBridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_file_is_io_error() {
        let err = crate::config::VoiceBridgeConfig::from_file("/nonexistent/voice-bridge.toml").unwrap_err();
        assert!(matches!(err, VoiceBridgeError::Io(_)));
        assert!(err.to_string().starts_with("I/O error"));
    }
}
