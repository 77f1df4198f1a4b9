//! Transport configuration, loadable from TOML or JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::logging::{init_logging, LogLevel};

/// Default per-request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Settings shared by servers and clients. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    /// Routing id; generated per role when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Request timeout. 0 disables it.
    pub timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<usize>,
    /// Log level for [`init_logging`](Self::init_logging). Servers and clients
    /// never install a subscriber on their own.
    pub logging: LogLevel,
    /// Also accept envelopes that carry no instance id.
    pub accept_untagged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_sweep_interval: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            timeout: DEFAULT_TIMEOUT_MS,
            max_message_size: None,
            logging: LogLevel::Info,
            accept_untagged: false,
            expiry_sweep_interval: None,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads and validates a config file, picking the format from its extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config = match ext.to_lowercase().as_str() {
            "toml" => Self::from_toml_str(&contents)?,
            "json" => Self::from_json_str(&contents)?,
            _ => {
                return Err(TransportError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).map_err(|e| TransportError::Config(e.to_string()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| TransportError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_message_size == Some(0) {
            return Err(TransportError::Config(
                "maxMessageSize must be greater than zero".to_string(),
            ));
        }
        if self.expiry_sweep_interval == Some(0) {
            return Err(TransportError::Config(
                "expirySweepInterval must be greater than zero".to_string(),
            ));
        }
        if self.instance_id.as_deref().is_some_and(str::is_empty) {
            return Err(TransportError::Config("instanceId must not be empty".to_string()));
        }
        Ok(())
    }

    /// The request timeout, or `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(self.timeout))
    }

    pub fn expiry_sweep_interval(&self) -> Option<Duration> {
        self.expiry_sweep_interval
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Installs the global log subscriber at the configured level.
    pub fn init_logging(&self) -> bool {
        init_logging(self.logging)
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = Some(max);
        self
    }

    pub fn with_logging(mut self, level: LogLevel) -> Self {
        self.logging = level;
        self
    }

    pub fn with_accept_untagged(mut self, accept: bool) -> Self {
        self.accept_untagged = accept;
        self
    }

    pub fn with_expiry_sweep_interval(mut self, interval: Duration) -> Self {
        self.expiry_sweep_interval = Some(interval.as_millis() as u64);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = TransportConfig::default();
        assert!(config.instance_id.is_none());
        assert_eq!(config.timeout, 30_000);
        assert_eq!(config.timeout(), Some(Duration::from_secs(30)));
        assert!(config.max_message_size.is_none());
        assert_eq!(config.logging, LogLevel::Info);
        assert!(!config.accept_untagged);
        assert!(config.expiry_sweep_interval().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_logging_off_installs_nothing() {
        let config = TransportConfig::new().with_logging(LogLevel::None);
        assert!(!config.init_logging());
    }

    #[test]
    fn test_zero_timeout_disables() {
        let config = TransportConfig::new().with_timeout(Duration::ZERO);
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_camel_case_json() {
        let config = TransportConfig::from_json_str(
            r#"{"instanceId": "server_A", "timeout": 500, "maxMessageSize": 1024,
                "logging": "debug", "acceptUntagged": true}"#,
        )
        .unwrap();
        assert_eq!(config.instance_id.as_deref(), Some("server_A"));
        assert_eq!(config.timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.max_message_size, Some(1024));
        assert_eq!(config.logging, LogLevel::Debug);
        assert!(config.accept_untagged);

        let out = serde_json::to_value(&config).unwrap();
        assert_eq!(out["instanceId"], "server_A");
        assert!(out.get("expirySweepInterval").is_none());
    }

    #[test]
    fn test_unknown_level_rejected() {
        let err = TransportConfig::from_json_str(r#"{"logging": "loud"}"#).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        assert!(TransportConfig::new().with_max_message_size(0).validate().is_err());
        let mut config = TransportConfig::new();
        config.expiry_sweep_interval = Some(0);
        assert!(config.validate().is_err());
        assert!(TransportConfig::new().with_instance_id("").validate().is_err());
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "instanceId": "client_B",
                "timeout": 0,
                "expirySweepInterval": 1000
            }}"#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.instance_id.as_deref(), Some("client_B"));
        assert_eq!(config.timeout(), None);
        assert_eq!(config.expiry_sweep_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
instanceId = "server_A"
timeout = 2500
maxMessageSize = 65536
logging = "warn"
acceptUntagged = true
            "#
        )
        .unwrap();

        let config = TransportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.instance_id.as_deref(), Some("server_A"));
        assert_eq!(config.timeout, 2500);
        assert_eq!(config.max_message_size, Some(65536));
        assert_eq!(config.logging, LogLevel::Warn);
        assert!(config.accept_untagged);
    }

    #[test]
    fn test_from_file_invalid_values() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "maxMessageSize = 0").unwrap();
        assert!(TransportConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = TransportConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("yaml"));
    }

    #[test]
    fn test_from_file_missing() {
        let err = TransportConfig::from_file(Path::new("/nonexistent/chanfetch.toml")).unwrap_err();
        assert!(matches!(err, TransportError::IoError(_)));
    }
}
