//! Error types for plugin authors

use thiserror::Error;

/// Errors that plugin hooks can return
#[derive(Error, Debug)]
pub enum PluginError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A service the plugin depends on is not available from the host
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The host's shutdown signal fired while the hook was running
    #[error("Cancelled")]
    Cancelled,

    /// A hook panicked inside the plugin's code unit
    #[error("Panicked: {0}")]
    Panicked(String),

    /// Custom error with message
    #[error("{0}")]
    Custom(String),
}

impl PluginError {
    /// Create a custom error with a message
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failure() {
        assert_eq!(
            PluginError::config("greeting must be a string").to_string(),
            "Configuration error: greeting must be a string"
        );
        assert_eq!(
            PluginError::ServiceUnavailable("clock".into()).to_string(),
            "Service unavailable: clock"
        );
        assert_eq!(PluginError::Cancelled.to_string(), "Cancelled");
        assert_eq!(PluginError::custom("flush failed").to_string(), "flush failed");
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn read_state() -> Result<(), PluginError> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "state.db"))?;
            Ok(())
        }

        let err = read_state().unwrap_err();
        assert!(matches!(err, PluginError::Io(_)));
        assert!(err.to_string().contains("state.db"));
    }
}
