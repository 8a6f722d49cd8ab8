//! Loading configuration files from disk.

use std::io::Write;
use std::time::Duration;

use linkgate_core::{BackoffConfig, ConfigError, LinkgateConfig, PolicyMode};

const DEPLOYED: &str = r#"
[gate]
policy = "fail-open"
max_attempts = 4
per_attempt_timeout = "250ms"
overall_deadline = "3s"

[gate.backoff]
type = "exponential"
initial_delay = "100ms"
max_delay = "400ms"

[gate.envelope]
target = "600ms"
jitter = "40ms"

[recovery]
queue_capacity = 32

[[stores]]
name = "orgs"
[stores.sqlite]
path = "app.db"
table = "company_members"
column = "user_id"

[[stores]]
name = "profiles"
required = false
[stores.sqlite]
path = "app.db"
table = "profiles"
column = "id"
"#;

#[test]
fn loads_and_validates_a_deployed_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(DEPLOYED.as_bytes()).unwrap();

    let config = LinkgateConfig::from_file(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.gate.policy, PolicyMode::FailOpen);
    assert_eq!(config.gate.max_attempts, 4);
    assert_eq!(config.gate.overall_deadline, Duration::from_secs(3));
    assert!(matches!(
        config.gate.backoff,
        BackoffConfig::Exponential { multiplier, .. } if (multiplier - 2.0).abs() < f64::EPSILON
    ));
    assert_eq!(config.recovery.queue_capacity, 32);
    assert_eq!(config.stores.len(), 2);
    assert!(config.stores[0].required);
    assert!(!config.stores[1].required);
    assert_eq!(
        config.stores[1].sqlite.as_ref().map(|s| s.table.as_str()),
        Some("profiles")
    );
}

#[test]
fn written_config_reloads_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("linkgate.toml");
    let original = LinkgateConfig::from_toml(DEPLOYED).unwrap();

    std::fs::write(&path, original.to_toml().unwrap()).unwrap();
    let reloaded = LinkgateConfig::from_file(&path).unwrap();

    assert_eq!(reloaded.gate, original.gate);
    assert_eq!(reloaded.stores, original.stores);
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = LinkgateConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn unknown_store_keys_are_rejected() {
    let err = LinkgateConfig::from_toml(
        r#"
[[stores]]
name = "orgs"
requried = true
"#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}
