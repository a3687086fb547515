//! Integration tests for config load/save.

use chat_stream_client::config::{self, CredentialMode};
use chat_stream_client::{Config, CredentialPlacement};
use predicates::prelude::*;
use std::time::Duration;

#[test]
fn load_existing_yaml_config() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    std::fs::write(
        &config_path,
        r#"
server:
  url: "wss://chat.example.com/ws/chat"
  credential: query
  token_param: access_token
auth:
  token: "test-token"
chat:
  dataset_id: "sales-2024"
  conversation_id: "c-17"
  streaming: false
reconnect:
  delay_ms: 500
  max_attempts: 10
request:
  timeout_secs: 120
"#,
    )
    .unwrap();

    let cfg = config::load(&config_path).expect("load should succeed");
    assert_eq!(cfg.server.url.as_deref(), Some("wss://chat.example.com/ws/chat"));
    assert_eq!(cfg.server.credential, CredentialMode::Query);
    assert_eq!(cfg.auth.token.as_deref(), Some("test-token"));
    assert_eq!(cfg.chat.dataset_id.as_deref(), Some("sales-2024"));
    assert_eq!(cfg.chat.conversation_id.as_deref(), Some("c-17"));
    assert_eq!(cfg.chat.streaming, Some(false));

    let options = cfg.client_options();
    assert_eq!(options.request_timeout, Some(Duration::from_secs(120)));
    assert_eq!(
        options.credential_placement,
        CredentialPlacement::Query {
            param: "access_token".into()
        }
    );
    assert_eq!(options.retry.next_delay(1), Some(Duration::from_millis(500)));
    assert_eq!(options.retry.next_delay(11), None);
    assert_eq!(cfg.resolve_token().as_deref(), Some("test-token"));
}

#[test]
fn save_creates_directory_and_file_when_missing() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join("chat-stream");
    let config_path = config_dir.join("config.yaml");
    assert!(!config_dir.exists(), "config dir should not exist yet");

    let mut config = Config::default();
    config.server.url = Some("ws://127.0.0.1:8000/ws/chat".into());
    config.chat.dataset_id = Some("sales".into());
    config.reconnect.delay_ms = Some(3000);

    config::save(&config_path, &config).expect("save should succeed");
    let pred = predicates::path::exists();
    assert!(
        pred.eval(&config_path),
        "config file should exist after save"
    );
    assert!(config_dir.exists(), "config directory should be created");
}

#[test]
fn round_trip_preserves_schema() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");

    let mut config = Config::default();
    config.server.url = Some("ws://localhost:8000/ws/chat".into());
    config.auth.token_env = Some("MY_TOKEN".into());
    config.chat.dataset_id = Some("inventory".into());
    config.reconnect.backoff_multiplier = Some(2.0);
    config.reconnect.max_delay_ms = Some(30_000);

    config::save(&config_path, &config).unwrap();
    let loaded = config::load(&config_path).unwrap();

    assert_eq!(loaded.server.url, config.server.url);
    assert_eq!(loaded.server.credential, CredentialMode::Header);
    assert_eq!(loaded.auth.token_env.as_deref(), Some("MY_TOKEN"));
    assert_eq!(loaded.chat.dataset_id.as_deref(), Some("inventory"));
    assert_eq!(loaded.reconnect.backoff_multiplier, Some(2.0));
    assert_eq!(loaded.reconnect.max_delay_ms, Some(30_000));
    assert!(loaded.request.timeout_secs.is_none());
}

#[test]
fn load_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = config::load(&dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, config::ConfigError::Io(_)));
}

#[test]
fn load_invalid_yaml_is_yaml_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "server: [unclosed").unwrap();
    let err = config::load(&path).unwrap_err();
    assert!(matches!(err, config::ConfigError::Yaml(_)));
}

#[test]
fn default_path_is_under_home() {
    if let Some(path) = config::default_config_path() {
        assert!(path.ends_with(".chat-stream/config.yaml"));
    }
}
