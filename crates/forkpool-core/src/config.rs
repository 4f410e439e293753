//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::MAX_PAYLOAD_LEN;

/// Default upper bound on concurrent workers.
pub const DEFAULT_MAX_PROCESSES: usize = 1;

/// Default periodic wake-up of the dispatcher thread.
pub const DEFAULT_DISPATCHER_TICK: Duration = Duration::from_secs(1);

/// Settings for a [`BackgroundTasks`](crate::BackgroundTasks) engine.
///
/// Loadable from JSON; missing fields take their defaults:
///
/// ```
/// use forkpool_core::EngineConfig;
///
/// let config = EngineConfig::from_json_str(r#"{ "max_processes": 4 }"#).unwrap();
/// assert_eq!(config.max_processes, 4);
/// assert!(config.background_thread);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on concurrently running workers (at least 1).
    pub max_processes: usize,

    /// Run a dispatcher thread that collects results in the background.
    /// When disabled, results are only collected while submitting or
    /// polling handles.
    pub background_thread: bool,

    /// Longest the dispatcher sleeps without an event before re-checking
    /// its workers.
    #[serde(rename = "dispatcher_tick_ms", with = "duration_ms")]
    pub dispatcher_tick: Duration,

    /// Largest serialized reply a worker may send; bigger replies are
    /// reported as `PayloadTooLarge`.
    pub max_payload_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_processes: DEFAULT_MAX_PROCESSES,
            background_thread: true,
            dispatcher_tick: DEFAULT_DISPATCHER_TICK,
            max_payload_bytes: MAX_PAYLOAD_LEN,
        }
    }
}

impl EngineConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker cap.
    pub fn with_max_processes(mut self, max_processes: usize) -> Self {
        self.max_processes = max_processes;
        self
    }

    /// Enable or disable the dispatcher thread.
    pub fn with_background_thread(mut self, enabled: bool) -> Self {
        self.background_thread = enabled;
        self
    }

    /// Set the dispatcher's idle wake-up period.
    pub fn with_dispatcher_tick(mut self, tick: Duration) -> Self {
        self.dispatcher_tick = tick;
        self
    }

    /// Set the reply size limit.
    pub fn with_max_payload_bytes(mut self, limit: u64) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    /// Check that every setting is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_processes < 1 {
            return Err(Error::ConfigInvalid(
                "max_processes must be at least 1".to_string(),
            ));
        }
        if self.dispatcher_tick.is_zero() {
            return Err(Error::ConfigInvalid(
                "dispatcher_tick_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_payload_bytes == 0 || self.max_payload_bytes > MAX_PAYLOAD_LEN {
            return Err(Error::ConfigInvalid(format!(
                "max_payload_bytes must be between 1 and {}",
                MAX_PAYLOAD_LEN
            )));
        }
        Ok(())
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::ConfigInvalid(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
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
        assert_eq!(config.max_processes, 1);
        assert!(config.background_thread);
        assert_eq!(config.dispatcher_tick, Duration::from_secs(1));
        assert_eq!(config.max_payload_bytes, MAX_PAYLOAD_LEN);
        config.validate().unwrap();
    }

    #[test]
    fn test_zero_processes_rejected() {
        let err = EngineConfig::new().with_max_processes(0).validate().unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
    }

    #[test]
    fn test_payload_limit_bounds() {
        assert!(EngineConfig::new().with_max_payload_bytes(0).validate().is_err());
        assert!(
            EngineConfig::new()
                .with_max_payload_bytes(MAX_PAYLOAD_LEN + 1)
                .validate()
                .is_err()
        );
        EngineConfig::new().with_max_payload_bytes(64).validate().unwrap();
    }

    #[test]
    fn test_json_roundtrip_uses_milliseconds() {
        let config = EngineConfig::new()
            .with_max_processes(3)
            .with_background_thread(false)
            .with_dispatcher_tick(Duration::from_millis(250));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"dispatcher_tick_ms\":250"));
        assert_eq!(EngineConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        assert!(matches!(
            EngineConfig::from_json_str("{ \"max_processes\": \"many\" }"),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_json_str("{ \"max_processes\": 0 }"),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ \"max_processes\": 2, \"background_thread\": false }}").unwrap();

        let config = EngineConfig::from_path(file.path()).unwrap();
        assert_eq!(config.max_processes, 2);
        assert!(!config.background_thread);

        assert!(matches!(
            EngineConfig::from_path(file.path().with_extension("missing")),
            Err(Error::Io(_))
        ));
    }
}
