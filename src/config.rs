//! Configuration loader and validator for the punch kiosk.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub device: Device,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub queue: Queue,
    #[serde(default)]
    pub shift: Shift,
    pub remote: Remote,
    #[serde(default)]
    pub credentials: Credentials,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Defaults to `sqlite://{data_dir}/kiosk.db`.
    #[serde(default)]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub company_id: String,
    /// Fixed device id. Generated and persisted on first start when absent.
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncSection {
    pub interval_seconds: u64,
    pub probe_interval_seconds: u64,
    pub batch_size: u32,
    pub request_timeout_seconds: u64,
    pub max_backoff_seconds: u64,
    /// Start a pass right after a punch is captured while online.
    pub submit_on_capture: bool,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            probe_interval_seconds: 15,
            batch_size: 25,
            request_timeout_seconds: 15,
            max_backoff_seconds: 300,
            submit_on_capture: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Queue {
    pub max_retries: u8,
    pub entry_ttl_hours: u64,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            max_retries: 3,
            entry_ttl_hours: 72,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Shift {
    pub default_open_shift_hours: u64,
    pub typical_shift_hours: u64,
    pub max_shift_hours: u64,
    /// Offset of the kiosk's local day from UTC.
    pub utc_offset_minutes: i32,
}

impl Default for Shift {
    fn default() -> Self {
        Self {
            default_open_shift_hours: 12,
            typical_shift_hours: 8,
            max_shift_hours: 16,
            utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    pub api_token: String,
}

/// Enrolled PIN records, `employee_id -> iterations$salt$hash`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    #[serde(default)]
    pub pins: BTreeMap<String, String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        match &self.app.database_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => format!(
                "sqlite://{}/kiosk.db",
                self.app.data_dir.trim_end_matches('/')
            ),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.device.company_id.trim().is_empty() {
        return Err(ConfigError::Invalid("device.company_id must be non-empty"));
    }
    if cfg.device.device_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
        return Err(ConfigError::Invalid("device.device_id must be non-empty when set"));
    }

    if cfg.sync.interval_seconds == 0 {
        return Err(ConfigError::Invalid("sync.interval_seconds must be > 0"));
    }
    if cfg.sync.probe_interval_seconds == 0 {
        return Err(ConfigError::Invalid("sync.probe_interval_seconds must be > 0"));
    }
    if cfg.sync.batch_size == 0 {
        return Err(ConfigError::Invalid("sync.batch_size must be > 0"));
    }
    if cfg.sync.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("sync.request_timeout_seconds must be > 0"));
    }
    if cfg.sync.max_backoff_seconds == 0 {
        return Err(ConfigError::Invalid("sync.max_backoff_seconds must be > 0"));
    }

    if cfg.queue.max_retries == 0 {
        return Err(ConfigError::Invalid("queue.max_retries must be > 0"));
    }
    if cfg.queue.entry_ttl_hours == 0 {
        return Err(ConfigError::Invalid("queue.entry_ttl_hours must be > 0"));
    }

    let shift = &cfg.shift;
    if shift.default_open_shift_hours == 0
        || shift.typical_shift_hours == 0
        || shift.max_shift_hours == 0
    {
        return Err(ConfigError::Invalid("shift hours must be > 0"));
    }
    if shift.typical_shift_hours > shift.max_shift_hours {
        return Err(ConfigError::Invalid(
            "shift.typical_shift_hours must not exceed shift.max_shift_hours",
        ));
    }
    if shift.utc_offset_minutes.abs() >= 24 * 60 {
        return Err(ConfigError::Invalid("shift.utc_offset_minutes must be within a day"));
    }

    if cfg.remote.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.base_url must be non-empty"));
    }
    if cfg.remote.api_token.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.api_token must be non-empty"));
    }

    Ok(())
}

/// A complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

device:
  company_id: "acme"

sync:
  interval_seconds: 60
  probe_interval_seconds: 15
  batch_size: 25
  request_timeout_seconds: 15
  max_backoff_seconds: 300
  submit_on_capture: true

queue:
  max_retries: 3
  entry_ttl_hours: 72

shift:
  default_open_shift_hours: 12
  typical_shift_hours: 8
  max_shift_hours: 16
  utc_offset_minutes: 0

remote:
  base_url: "https://payroll.example.com/"
  api_token: "YOUR_PAYROLL_API_TOKEN"

credentials:
  pins: {}
"#
}
