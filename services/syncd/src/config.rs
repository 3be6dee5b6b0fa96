//! syncd configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/edgelink/syncd.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `cloud.base_url`
//!
//! Blank routing credentials are accepted at load time: the manager stays
//! inactive and complains periodically instead of failing startup.
//!
//! # Secret file format
//! Raw secret string on a single line; trimmed on read.

use serde::Deserialize;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level syncd configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub schema_version: u32,
    pub cloud: CloudConfig,
    pub event_storage: EventStorageConfig,
}

#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub base_url: String,
    pub ws_path: String,
    /// Routing key identifying this edge; may be blank.
    pub routing_key: String,
    /// The secret (read from the secret file, not the file path); may be blank.
    pub secret: String,
    pub reconnect_timeout_ms: u64,
}

impl CloudConfig {
    /// Both routing credentials present.
    pub fn has_credentials(&self) -> bool {
        !self.routing_key.is_empty() && !self.secret.is_empty()
    }

    /// Full WebSocket URL of the cloud edge endpoint.
    pub fn ws_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.ws_path
        )
    }
}

#[derive(Debug, Clone)]
pub struct EventStorageConfig {
    pub sqlite_path: String,
    /// Page size of the event log range scan.
    pub max_read_records: u32,
    /// Outer loop sleep when the log has nothing new, in ms.
    pub no_records_sleep_ms: u64,
    /// Sleep between failed uplink batch attempts, in ms.
    pub sleep_between_batches_ms: u64,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    cloud: Option<RawCloudConfig>,
    event_storage: Option<RawEventStorageConfig>,
}

#[derive(Debug, Deserialize)]
struct RawCloudConfig {
    base_url: Option<String>,
    ws_path: Option<String>,
    routing_key: Option<String>,
    secret_file: Option<String>,
    reconnect_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawEventStorageConfig {
    sqlite_path: Option<String>,
    max_read_records: Option<u32>,
    no_records_sleep_ms: Option<u64>,
    sleep_between_batches_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load syncd config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<SyncConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load syncd config from the default path `/etc/edgelink/syncd.toml`.
pub fn load_config() -> Result<SyncConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/edgelink/syncd.toml"))
}

/// Load syncd config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<SyncConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    // Validate schema_version
    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    // Validate cloud section
    let raw_cloud = raw
        .cloud
        .ok_or_else(|| ConfigError::MissingField("cloud".to_owned()))?;
    let base_url = raw_cloud
        .base_url
        .ok_or_else(|| ConfigError::MissingField("cloud.base_url".to_owned()))?;
    let secret = match raw_cloud.secret_file {
        Some(ref path) if !path.is_empty() => read_secret_file(path)?,
        _ => String::new(),
    };
    let cloud = CloudConfig {
        base_url,
        ws_path: raw_cloud.ws_path.unwrap_or_else(|| "/ws/v1/edge".to_owned()),
        routing_key: raw_cloud.routing_key.unwrap_or_default(),
        secret,
        reconnect_timeout_ms: raw_cloud.reconnect_timeout_ms.unwrap_or(3000),
    };

    // Event storage defaults
    let event_storage = match raw.event_storage {
        Some(s) => EventStorageConfig {
            sqlite_path: s
                .sqlite_path
                .unwrap_or_else(|| "/var/lib/edgelink/syncd.sqlite3".to_owned()),
            max_read_records: s.max_read_records.unwrap_or(50),
            no_records_sleep_ms: s.no_records_sleep_ms.unwrap_or(1000),
            sleep_between_batches_ms: s.sleep_between_batches_ms.unwrap_or(1000),
        },
        None => EventStorageConfig {
            sqlite_path: "/var/lib/edgelink/syncd.sqlite3".to_owned(),
            max_read_records: 50,
            no_records_sleep_ms: 1000,
            sleep_between_batches_ms: 1000,
        },
    };

    if event_storage.max_read_records == 0 {
        return Err(ConfigError::InvalidValue(
            "event_storage.max_read_records must be > 0".to_owned(),
        ));
    }

    Ok(SyncConfig {
        schema_version,
        cloud,
        event_storage,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {s}"),
            ConfigError::Parse(s) => write!(f, "Parse error: {s}"),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {s}"),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {s}"),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Secret file reader
// ---------------------------------------------------------------------------

fn read_secret_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading secret file '{path}': {e}")))?;
    Ok(content.trim().to_owned())
}
