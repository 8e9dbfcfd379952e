use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracering::Config as RingConfig;

/// Writer configuration. Immutable once a writer is built from it.
///
/// Every field has a default, so a JSON file only needs the fields it
/// changes. Durations are written as whole milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Stage-1 capacity in traces. Any value ≥ 1.
    ///
    /// Default: 1024
    pub trace_buffer_size: usize,

    /// Stage-2 capacity in serialized payloads, rounded up to a power of two.
    ///
    /// Default: 1024
    pub serialized_buffer_size: usize,

    /// Interval of the periodic flush. Zero disables it, leaving only
    /// threshold and explicit flushes.
    ///
    /// Default: 1s
    #[serde(with = "duration_ms")]
    pub flush_frequency: Duration,

    /// Upper bound on a single transport call.
    ///
    /// Default: 10s
    #[serde(with = "duration_ms")]
    pub transport_timeout: Duration,

    /// Stage-2 item count that triggers an early send. Zero means half the
    /// Stage-2 capacity.
    ///
    /// Default: 0
    pub flush_threshold_items: usize,

    /// Pending serialized bytes that trigger an early send.
    ///
    /// Default: 5_000_000
    pub flush_threshold_bytes: usize,

    /// Most payloads handed to the transport in one call.
    ///
    /// Default: 10_000
    pub max_batch_items: usize,

    /// Timeout of the flush performed by `close`.
    ///
    /// Default: 1s
    #[serde(with = "duration_ms")]
    pub close_flush_timeout: Duration,

    /// How long `close` waits for each worker thread to exit.
    ///
    /// Default: 1s
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,

    pub agent_host: String,
    pub agent_port: u16,
    /// When set, the agent is reached over this socket instead of host/port.
    pub unix_domain_socket: Option<PathBuf>,

    /// Collect ring-level counters.
    ///
    /// Default: false
    pub enable_metrics: bool,
}

pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_FLUSH_THRESHOLD_BYTES: usize = 5_000_000;
pub const DEFAULT_AGENT_HOST: &str = "localhost";
pub const DEFAULT_AGENT_PORT: u16 = 8126;
const TRACES_ENDPOINT: &str = "v0.4/traces";

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            trace_buffer_size: DEFAULT_BUFFER_SIZE,
            serialized_buffer_size: DEFAULT_BUFFER_SIZE,
            flush_frequency: Duration::from_secs(1),
            transport_timeout: Duration::from_secs(10),
            flush_threshold_items: 0,
            flush_threshold_bytes: DEFAULT_FLUSH_THRESHOLD_BYTES,
            max_batch_items: 10_000,
            close_flush_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(1),
            agent_host: DEFAULT_AGENT_HOST.to_string(),
            agent_port: DEFAULT_AGENT_PORT,
            unix_domain_socket: None,
            enable_metrics: false,
        }
    }
}

impl WriterConfig {
    /// Small buffers and a fast timer; useful in tests.
    pub fn low_latency() -> Self {
        Self {
            trace_buffer_size: 64,
            serialized_buffer_size: 64,
            flush_frequency: Duration::from_millis(10),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trace_buffer_size == 0 {
            return Err(ConfigError::InvalidCapacity {
                field: "trace_buffer_size",
                value: self.trace_buffer_size,
            });
        }
        let max_serialized = 1usize << RingConfig::MAX_RING_BITS;
        if self.serialized_buffer_size == 0 || self.serialized_buffer_size > max_serialized {
            return Err(ConfigError::InvalidCapacity {
                field: "serialized_buffer_size",
                value: self.serialized_buffer_size,
            });
        }
        if self.max_batch_items == 0 {
            return Err(ConfigError::InvalidCapacity {
                field: "max_batch_items",
                value: self.max_batch_items,
            });
        }
        if self.flush_threshold_items > self.serialized_capacity() {
            return Err(ConfigError::InvalidThreshold {
                field: "flush_threshold_items",
                reason: format!(
                    "{} exceeds the serialized buffer capacity {}",
                    self.flush_threshold_items,
                    self.serialized_capacity()
                ),
            });
        }
        if self.flush_threshold_bytes == 0 {
            return Err(ConfigError::InvalidThreshold {
                field: "flush_threshold_bytes",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.transport_timeout.is_zero() {
            return Err(ConfigError::InvalidThreshold {
                field: "transport_timeout",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Actual Stage-2 capacity after rounding up to a power of two.
    pub fn serialized_capacity(&self) -> usize {
        self.serialized_buffer_size.max(1).next_power_of_two()
    }

    /// Item threshold in effect, with the zero default resolved.
    pub fn effective_flush_threshold_items(&self) -> usize {
        if self.flush_threshold_items == 0 {
            (self.serialized_capacity() / 2).max(1)
        } else {
            self.flush_threshold_items
        }
    }

    /// Traces endpoint, as reported to response listeners.
    pub fn endpoint(&self) -> String {
        match &self.unix_domain_socket {
            Some(path) => format!("unix://{}/{}", path.display(), TRACES_ENDPOINT),
            None => format!(
                "http://{}:{}/{}",
                self.agent_host, self.agent_port, TRACES_ENDPOINT
            ),
        }
    }

    pub fn with_trace_buffer_size(mut self, size: usize) -> Self {
        self.trace_buffer_size = size;
        self
    }

    pub fn with_serialized_buffer_size(mut self, size: usize) -> Self {
        self.serialized_buffer_size = size;
        self
    }

    pub fn with_flush_frequency(mut self, frequency: Duration) -> Self {
        self.flush_frequency = frequency;
        self
    }

    pub fn with_transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout = timeout;
        self
    }

    pub fn with_flush_threshold_items(mut self, items: usize) -> Self {
        self.flush_threshold_items = items;
        self
    }

    pub fn with_flush_threshold_bytes(mut self, bytes: usize) -> Self {
        self.flush_threshold_bytes = bytes;
        self
    }

    pub fn with_max_batch_items(mut self, items: usize) -> Self {
        self.max_batch_items = items;
        self
    }

    pub fn with_close_flush_timeout(mut self, timeout: Duration) -> Self {
        self.close_flush_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_agent(mut self, host: impl Into<String>, port: u16) -> Self {
        self.agent_host = host.into();
        self.agent_port = port;
        self
    }

    pub fn with_unix_domain_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.unix_domain_socket = Some(path.into());
        self
    }

    pub fn with_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = enable;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WriterConfig::default();
        assert_eq!(config.trace_buffer_size, 1024);
        assert_eq!(config.flush_frequency, Duration::from_secs(1));
        assert_eq!(config.effective_flush_threshold_items(), 512);
        assert_eq!(config.endpoint(), "http://localhost:8126/v0.4/traces");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = WriterConfig::from_json_str(
            r#"{ "trace_buffer_size": 3, "flush_frequency": 250, "agent_port": 9000 }"#,
        )
        .unwrap();

        assert_eq!(config.trace_buffer_size, 3);
        assert_eq!(config.flush_frequency, Duration::from_millis(250));
        assert_eq!(config.agent_port, 9000);
        assert_eq!(config.transport_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_json_roundtrip_in_millis() {
        let config = WriterConfig::default().with_shutdown_grace(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["shutdown_grace"], 1500);
        assert_eq!(WriterConfig::from_json_str(&json.to_string()).unwrap(), config);
    }

    #[test]
    fn test_serialized_capacity_rounds_up() {
        let config = WriterConfig::default().with_serialized_buffer_size(100);
        assert_eq!(config.serialized_capacity(), 128);
        assert_eq!(config.effective_flush_threshold_items(), 64);

        let config = config.with_flush_threshold_items(10);
        assert_eq!(config.effective_flush_threshold_items(), 10);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(matches!(
            WriterConfig::default().with_trace_buffer_size(0).validate(),
            Err(ConfigError::InvalidCapacity { field: "trace_buffer_size", .. })
        ));
        assert!(matches!(
            WriterConfig::default().with_serialized_buffer_size(0).validate(),
            Err(ConfigError::InvalidCapacity { .. })
        ));
        assert!(matches!(
            WriterConfig::default()
                .with_serialized_buffer_size(8)
                .with_flush_threshold_items(9)
                .validate(),
            Err(ConfigError::InvalidThreshold { field: "flush_threshold_items", .. })
        ));
        assert!(matches!(
            WriterConfig::default().with_transport_timeout(Duration::ZERO).validate(),
            Err(ConfigError::InvalidThreshold { .. })
        ));
        assert!(WriterConfig::from_json_str(r#"{ "max_batch_items": 0 }"#).is_err());
    }

    #[test]
    fn test_unix_socket_endpoint() {
        let config = WriterConfig::default().with_unix_domain_socket("/var/run/agent.sock");
        assert_eq!(config.endpoint(), "unix:///var/run/agent.sock/v0.4/traces");
    }

    #[test]
    fn test_from_json_file_missing() {
        let err = WriterConfig::from_json_file("/nonexistent/writer.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
