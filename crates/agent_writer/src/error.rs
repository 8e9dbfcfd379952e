use std::time::Duration;
use thiserror::Error;

/// Invalid or unreadable writer configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid capacity for {field}: {value}")]
    InvalidCapacity { field: &'static str, value: usize },
    #[error("invalid threshold for {field}: {reason}")]
    InvalidThreshold {
        field: &'static str,
        reason: String,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// Errors surfaced by writer construction and lifecycle calls.
///
/// `write` and `flush` never return errors; only building and starting can.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("missing {0}; set it on the builder")]
    MissingComponent(&'static str),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Failure to turn a trace into bytes. The trace is dropped, never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported trace: {0}")]
    Unsupported(String),
}

/// Failure of a single transport call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Network or IO error
    #[error("transport error: {0}")]
    Transport(String),
    /// The call did not complete within the configured timeout
    #[error("transport call timed out after {0:?}")]
    Timeout(Duration),
    /// All retry attempts exhausted
    #[error("all retry attempts exhausted after {attempts} tries")]
    RetriesExhausted { attempts: u32 },
}

impl TransportError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transport(_) | TransportError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_from_json() {
        let err: ConfigError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, ConfigError::Parse(_)));

        let writer_err: WriterError = err.into();
        assert!(writer_err.to_string().starts_with("failed to parse configuration"));
    }

    #[test]
    fn test_transport_error_retryable() {
        assert!(TransportError::Transport("refused".into()).is_retryable());
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!TransportError::RetriesExhausted { attempts: 3 }.is_retryable());
    }
}
