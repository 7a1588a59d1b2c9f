//! Engine configuration
//!
//! Every field has a default; JSON documents only need the fields they
//! change. Durations are written in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use concord_core::{ClockMode, ConcordError, ConcordResult};
use concord_state::DEFAULT_STORAGE_KEY;

/// Engine configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Periodic persistence flush
    #[serde(rename = "flushIntervalMs", with = "millis")]
    pub flush_interval: Duration,
    /// How long `query` waits for a SYNC reply
    #[serde(rename = "queryTimeoutMs", with = "millis")]
    pub query_timeout: Duration,
    /// Storage key of the persisted record
    pub storage_key: String,
    pub logical_clock: ClockMode,
    pub realtime: RealtimeConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            flush_interval: Duration::from_secs(5),
            query_timeout: Duration::from_secs(5),
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            logical_clock: ClockMode::WallClock,
            realtime: RealtimeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> ConcordResult<Self> {
        let config: EngineConfig =
            serde_json::from_str(raw).map_err(|e| ConcordError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConcordResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConcordError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> ConcordResult<()> {
        if self.flush_interval.is_zero() {
            return Err(ConcordError::Config("flushIntervalMs must be positive".into()));
        }
        if self.query_timeout.is_zero() {
            return Err(ConcordError::Config("queryTimeoutMs must be positive".into()));
        }
        if self.storage_key.is_empty() {
            return Err(ConcordError::Config("storageKey must not be empty".into()));
        }
        self.realtime.validate()
    }
}

/// Realtime channel configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RealtimeConfig {
    /// Server endpoint; no channel is opened without one
    pub url: Option<String>,
    /// First reconnect delay; doubles per attempt
    #[serde(rename = "baseDelayMs", with = "millis")]
    pub base_delay: Duration,
    /// Reconnect attempts before giving up
    pub max_attempts: u32,
    #[serde(rename = "heartbeatIntervalMs", with = "millis")]
    pub heartbeat_interval: Duration,
    /// Outbound message queue depth
    pub outbound_buffer: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            url: None,
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            outbound_buffer: 64,
        }
    }
}

impl RealtimeConfig {
    pub fn validate(&self) -> ConcordResult<()> {
        if self.max_attempts == 0 {
            return Err(ConcordError::Config("realtime.maxAttempts must be at least 1".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConcordError::Config(
                "realtime.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(ConcordError::Config("realtime.outboundBuffer must be positive".into()));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it
    pub level: String,
    /// JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

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
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.query_timeout, Duration::from_secs(5));
        assert_eq!(config.storage_key, "concord.state");
        assert_eq!(config.realtime.base_delay, Duration::from_millis(1000));
        assert_eq!(config.realtime.max_attempts, 5);
        assert_eq!(config.realtime.heartbeat_interval, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = EngineConfig::from_json_str(
            r#"{
                "flushIntervalMs": 250,
                "logicalClock": "counter",
                "realtime": { "url": "ws://localhost:9000/sync", "maxAttempts": 3 },
                "logging": { "json": true }
            }"#,
        )
        .unwrap();

        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.query_timeout, Duration::from_secs(5));
        assert_eq!(config.logical_clock, ClockMode::Counter);
        assert_eq!(config.realtime.url.as_deref(), Some("ws://localhost:9000/sync"));
        assert_eq!(config.realtime.max_attempts, 3);
        assert_eq!(config.realtime.base_delay, Duration::from_millis(1000));
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            EngineConfig::from_json_str(r#"{"realtime": {"maxAttempts": 0}}"#),
            Err(ConcordError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_str(r#"{"flushIntervalMs": "soon"}"#),
            Err(ConcordError::Config(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"storageKey": "popup.state"}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.storage_key, "popup.state");
        assert!(EngineConfig::from_file("/nonexistent/concord.json").is_err());
    }
}
