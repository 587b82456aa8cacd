//! Session configuration.
//!
//! All timing and addressing constants consumed by the session live in
//! [`SessionConfig`]. Values can come from the defaults, a JSON file, or
//! `BLE_LINK_*` environment variables.
//!
//! # Example
//!
//! ```
//! use ble_link::config::SessionConfig;
//!
//! let config = SessionConfig::from_json(r#"{ "scan_window_ms": 3000 }"#).unwrap();
//! assert_eq!(config.scan_window_ms, 3000);
//! assert_eq!(config.max_write_len, 16);
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Service the peripheral advertises and exposes its command characteristic on.
pub const DEFAULT_SERVICE_ID: Uuid = Uuid::from_u128(0x00001234_0000_1000_8000_00805f9b34fb);

/// Write-without-response characteristic commands are sent to.
pub const DEFAULT_CHARACTERISTIC_ID: Uuid = Uuid::from_u128(0x00001235_0000_1000_8000_00805f9b34fb);

/// Largest single write accepted by the peripheral.
pub const DEFAULT_MAX_WRITE_LEN: usize = 16;

/// Upper bound for `max_write_len` (ATT MTU 517 minus 3 bytes of header).
pub const MAX_WRITE_LEN_LIMIT: usize = 514;

/// Prefix of the environment variables read by [`SessionConfig::from_env`].
pub const ENV_PREFIX: &str = "BLE_LINK_";

/// Timing and addressing parameters for a device session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long each scan window collects advertisements.
    pub scan_window_ms: u64,
    /// Delay before rescanning after a scan could not be started.
    pub rescan_delay_ms: u64,
    /// Delay before rescanning after adapter refusal or a failed write.
    pub failure_retry_delay_ms: u64,
    /// Bound on the connect sequence and on each write.
    pub operation_timeout_ms: u64,
    /// Service UUID used as scan filter and write target.
    pub service_id: Uuid,
    /// Characteristic UUID commands are written to.
    pub characteristic_id: Uuid,
    /// Writes longer than this are split into chunks.
    pub max_write_len: usize,
    /// Report every advertisement, not just the first per peripheral.
    pub allow_duplicates: bool,
    /// Command queued before the first scan to put the peripheral in a known state.
    pub initial_command: Option<String>,
    /// Consecutive failures after which the session reports itself degraded.
    pub degraded_after: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_window_ms: 5000,
            rescan_delay_ms: 500,
            failure_retry_delay_ms: 500,
            operation_timeout_ms: 10_000,
            service_id: DEFAULT_SERVICE_ID,
            characteristic_id: DEFAULT_CHARACTERISTIC_ID,
            max_write_len: DEFAULT_MAX_WRITE_LEN,
            allow_duplicates: true,
            initial_command: None,
            degraded_after: 5,
        }
    }
}

impl SessionConfig {
    /// Scan window as a [`Duration`].
    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    /// Rescan delay as a [`Duration`].
    pub fn rescan_delay(&self) -> Duration {
        Duration::from_millis(self.rescan_delay_ms)
    }

    /// Failure retry delay as a [`Duration`].
    pub fn failure_retry_delay(&self) -> Duration {
        Duration::from_millis(self.failure_retry_delay_ms)
    }

    /// Operation timeout as a [`Duration`].
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_window_ms == 0 {
            return Err(ConfigError::Invalid("scan_window_ms must be > 0"));
        }
        if self.rescan_delay_ms == 0 {
            return Err(ConfigError::Invalid("rescan_delay_ms must be > 0"));
        }
        if self.failure_retry_delay_ms == 0 {
            return Err(ConfigError::Invalid("failure_retry_delay_ms must be > 0"));
        }
        if self.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid("operation_timeout_ms must be > 0"));
        }
        if self.max_write_len == 0 {
            return Err(ConfigError::Invalid("max_write_len must be > 0"));
        }
        if self.max_write_len > MAX_WRITE_LEN_LIMIT {
            return Err(ConfigError::Invalid("max_write_len must be <= 514"));
        }
        if self.degraded_after == 0 {
            return Err(ConfigError::Invalid("degraded_after must be > 0"));
        }
        if matches!(&self.initial_command, Some(cmd) if cmd.is_empty()) {
            return Err(ConfigError::Invalid("initial_command must not be empty"));
        }
        Ok(())
    }

    /// Parse a JSON document. Missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_json(&json)
    }

    /// Build a configuration from `BLE_LINK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    ///
    /// Keys are the upper-cased field names prefixed with [`ENV_PREFIX`],
    /// e.g. `BLE_LINK_SCAN_WINDOW_MS`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Self::default();

        if let Some(v) = get("SCAN_WINDOW_MS") {
            config.scan_window_ms = parse_field("SCAN_WINDOW_MS", &v)?;
        }
        if let Some(v) = get("RESCAN_DELAY_MS") {
            config.rescan_delay_ms = parse_field("RESCAN_DELAY_MS", &v)?;
        }
        if let Some(v) = get("FAILURE_RETRY_DELAY_MS") {
            config.failure_retry_delay_ms = parse_field("FAILURE_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = get("OPERATION_TIMEOUT_MS") {
            config.operation_timeout_ms = parse_field("OPERATION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("SERVICE_ID") {
            config.service_id = parse_field("SERVICE_ID", &v)?;
        }
        if let Some(v) = get("CHARACTERISTIC_ID") {
            config.characteristic_id = parse_field("CHARACTERISTIC_ID", &v)?;
        }
        if let Some(v) = get("MAX_WRITE_LEN") {
            config.max_write_len = parse_field("MAX_WRITE_LEN", &v)?;
        }
        if let Some(v) = get("ALLOW_DUPLICATES") {
            config.allow_duplicates = parse_field("ALLOW_DUPLICATES", &v)?;
        }
        if let Some(v) = get("INITIAL_COMMAND") {
            config.initial_command = Some(v);
        }
        if let Some(v) = get("DEGRADED_AFTER") {
            config.degraded_after = parse_field("DEGRADED_AFTER", &v)?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_field<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    value.trim().parse().map_err(|_| ConfigError::BadValue {
        name,
        value: value.to_string(),
    })
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// A value is out of range.
    Invalid(&'static str),
    /// A variable could not be parsed.
    BadValue { name: &'static str, value: String },
    /// The JSON document is malformed.
    Parse(String),
    /// The configuration file could not be read.
    Io(std::io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "invalid session config: {}", msg),
            Self::BadValue { name, value } => {
                write!(f, "invalid value for {}{}: {:?}", ENV_PREFIX, name, value)
            }
            Self::Parse(msg) => write!(f, "malformed config: {}", msg),
            Self::Io(e) => write!(f, "cannot read config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_device() {
        let config = SessionConfig::default();
        assert_eq!(config.scan_window(), Duration::from_secs(5));
        assert_eq!(config.rescan_delay(), Duration::from_millis(500));
        assert_eq!(config.failure_retry_delay(), Duration::from_millis(500));
        assert_eq!(
            config.service_id.to_string(),
            "00001234-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            config.characteristic_id.to_string(),
            "00001235-0000-1000-8000-00805f9b34fb"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = SessionConfig {
            scan_window_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_write_len_bounds() {
        let zero = SessionConfig {
            max_write_len: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let huge = SessionConfig {
            max_write_len: MAX_WRITE_LEN_LIMIT + 1,
            ..Default::default()
        };
        assert!(huge.validate().is_err());

        let max = SessionConfig {
            max_write_len: MAX_WRITE_LEN_LIMIT,
            ..Default::default()
        };
        assert!(max.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_initial_command() {
        let config = SessionConfig {
            initial_command: Some(String::new()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_partial() {
        let config = SessionConfig::from_json(
            r#"{ "rescan_delay_ms": 250, "initial_command": "off" }"#,
        )
        .unwrap();
        assert_eq!(config.rescan_delay_ms, 250);
        assert_eq!(config.initial_command.as_deref(), Some("off"));
        assert_eq!(config.scan_window_ms, 5000);
    }

    #[test]
    fn test_from_json_uuid() {
        let config = SessionConfig::from_json(
            r#"{ "service_id": "0000180f-0000-1000-8000-00805f9b34fb" }"#,
        )
        .unwrap();
        assert_eq!(config.service_id, Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb));
    }

    #[test]
    fn test_from_json_malformed() {
        let result = SessionConfig::from_json("{ scan_window_ms: }");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_json_invalid_value() {
        let result = SessionConfig::from_json(r#"{ "degraded_after": 0 }"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("BLE_LINK_SCAN_WINDOW_MS", "1500"),
            ("BLE_LINK_ALLOW_DUPLICATES", "false"),
            ("BLE_LINK_INITIAL_COMMAND", "mokaoff"),
        ]
        .into_iter()
        .collect();

        let config = SessionConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.scan_window_ms, 1500);
        assert!(!config.allow_duplicates);
        assert_eq!(config.initial_command.as_deref(), Some("mokaoff"));
        assert_eq!(config.max_write_len, DEFAULT_MAX_WRITE_LEN);
    }

    #[test]
    fn test_from_lookup_bad_value() {
        let result = SessionConfig::from_lookup(|k| {
            (k == "BLE_LINK_MAX_WRITE_LEN").then(|| "sixteen".to_string())
        });
        let err = result.unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value for BLE_LINK_MAX_WRITE_LEN: \"sixteen\""
        );
    }
}
