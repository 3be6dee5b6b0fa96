/// Tests for syncd config loading: required fields, defaults, secret file
/// handling, and the blank-credentials case.
use std::io::Write;
use syncd::config::{ConfigError, load_config_from_str};
use tempfile::NamedTempFile;

fn secret_file(content: &str) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(content.as_bytes()).unwrap();
    f.flush().unwrap();
    f
}

#[test]
fn full_config_parses() {
    let secret = secret_file("s3cr3t\n");
    let toml = format!(
        r#"
schema_version = 1

[cloud]
base_url = "wss://cloud.example.com"
routing_key = "rk-123"
secret_file = "{}"
reconnect_timeout_ms = 5000

[event_storage]
sqlite_path = "/tmp/syncd.sqlite3"
max_read_records = 100
no_records_sleep_ms = 500
sleep_between_batches_ms = 250
"#,
        secret.path().display()
    );
    let cfg = load_config_from_str(&toml).unwrap();
    assert_eq!(cfg.schema_version, 1);
    assert_eq!(cfg.cloud.base_url, "wss://cloud.example.com");
    assert_eq!(cfg.cloud.routing_key, "rk-123");
    assert_eq!(cfg.cloud.secret, "s3cr3t", "secret must be trimmed");
    assert_eq!(cfg.cloud.reconnect_timeout_ms, 5000);
    assert!(cfg.cloud.has_credentials());
    assert_eq!(cfg.event_storage.max_read_records, 100);
    assert_eq!(cfg.event_storage.no_records_sleep_ms, 500);
    assert_eq!(cfg.event_storage.sleep_between_batches_ms, 250);
}

#[test]
fn defaults_are_applied() {
    let toml = r#"
schema_version = 1

[cloud]
base_url = "wss://cloud.example.com"
"#;
    let cfg = load_config_from_str(toml).unwrap();
    assert_eq!(cfg.cloud.ws_path, "/ws/v1/edge");
    assert_eq!(cfg.cloud.reconnect_timeout_ms, 3000);
    assert_eq!(cfg.event_storage.sqlite_path, "/var/lib/edgelink/syncd.sqlite3");
    assert_eq!(cfg.event_storage.max_read_records, 50);
    assert_eq!(cfg.event_storage.no_records_sleep_ms, 1000);
    assert_eq!(cfg.event_storage.sleep_between_batches_ms, 1000);
}

#[test]
fn blank_credentials_are_accepted_but_flagged() {
    let toml = r#"
schema_version = 1

[cloud]
base_url = "wss://cloud.example.com"
"#;
    let cfg = load_config_from_str(toml).unwrap();
    assert!(cfg.cloud.routing_key.is_empty());
    assert!(cfg.cloud.secret.is_empty());
    assert!(!cfg.cloud.has_credentials());
}

#[test]
fn ws_url_joins_base_and_path() {
    let toml = r#"
schema_version = 1

[cloud]
base_url = "wss://cloud.example.com/"
"#;
    let cfg = load_config_from_str(toml).unwrap();
    assert_eq!(cfg.cloud.ws_url(), "wss://cloud.example.com/ws/v1/edge");
}

#[test]
fn missing_schema_version_is_rejected() {
    let toml = r#"
[cloud]
base_url = "wss://cloud.example.com"
"#;
    match load_config_from_str(toml) {
        Err(ConfigError::MissingField(f)) => assert_eq!(f, "schema_version"),
        other => panic!("expected MissingField, got {other:?}"),
    }
}

#[test]
fn wrong_schema_version_is_rejected() {
    let toml = r#"
schema_version = 2

[cloud]
base_url = "wss://cloud.example.com"
"#;
    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::InvalidValue(_))
    ));
}

#[test]
fn missing_base_url_is_rejected() {
    let toml = r#"
schema_version = 1

[cloud]
routing_key = "rk"
"#;
    match load_config_from_str(toml) {
        Err(ConfigError::MissingField(f)) => assert_eq!(f, "cloud.base_url"),
        other => panic!("expected MissingField, got {other:?}"),
    }
}

#[test]
fn zero_page_size_is_rejected() {
    let toml = r#"
schema_version = 1

[cloud]
base_url = "wss://cloud.example.com"

[event_storage]
max_read_records = 0
"#;
    assert!(matches!(
        load_config_from_str(toml),
        Err(ConfigError::InvalidValue(_))
    ));
}

#[test]
fn unreadable_secret_file_is_an_io_error() {
    let toml = r#"
schema_version = 1

[cloud]
base_url = "wss://cloud.example.com"
secret_file = "/nonexistent/path/to/secret"
"#;
    assert!(matches!(load_config_from_str(toml), Err(ConfigError::Io(_))));
}
