#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use conduit_core::ErrorKind;
use conduit_mcp::{CapabilityHandler, ConduitConfig, ServerState, TransportKind};
use serde_json::json;
use std::io::Write;
use std::time::Duration;

#[tokio::test]
async fn test_load_and_connect_from_file() {
    let stub = support::stdio_stub();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
health_check_interval_secs = 0

[retry]
max_retries = 1
initial_delay_ms = 10
jitter_factor = 0.0

[[servers]]
name = "calc"
transport = "stdio"
endpoint = "{stub}"
timeout_ms = 5000

[servers.credentials]
API_TOKEN = "from-file"
"#
    )
    .unwrap();

    let config = ConduitConfig::load(file.path()).await.unwrap();
    assert_eq!(config.retry.max_retries, 1);
    assert!(config.health_check_interval().is_none());
    let calc = &config.servers[0];
    assert_eq!(calc.transport_kind, TransportKind::Process);
    assert_eq!(calc.declared_timeout(), Duration::from_secs(5));
    assert_eq!(calc.connect_timeout(), Duration::from_secs(10));
    assert!(!format!("{calc:?}").contains("from-file"));

    let (handler, errors) = CapabilityHandler::from_config(&config).await.unwrap();
    assert!(errors.is_empty());
    assert!(!handler.is_health_loop_running());
    assert_eq!(handler.server_state("calc").await, ServerState::Connected);
    let value = handler
        .execute_tool("calc", "whoami", json!({}), None)
        .await
        .unwrap();
    assert_eq!(value["content"][0]["text"], "from-file");
    handler.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_servers_are_reported() {
    let config = ConduitConfig::from_toml_str(
        r#"
[retry]
max_retries = 0

[[servers]]
name = "ghost"
transport = "process"
endpoint = "/nonexistent/conduit-no-such-server --flag"
"#,
    )
    .unwrap();

    let (handler, errors) = CapabilityHandler::from_config(&config).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind(), ErrorKind::Configuration);
    assert_eq!(handler.server_names().await, vec!["ghost".to_string()]);
    assert_eq!(handler.server_state("ghost").await, ServerState::Disconnected);

    // The default interval starts the health loop; shutdown stops it.
    assert_eq!(config.health_check_interval(), Some(Duration::from_secs(60)));
    assert!(handler.is_health_loop_running());
    handler.shutdown().await;
    assert!(!handler.is_health_loop_running());
}

#[tokio::test]
async fn test_load_rejects_missing_and_invalid_files() {
    let dir = tempfile::tempdir().unwrap();
    let err = ConduitConfig::load(dir.path().join("missing.toml")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let path = dir.path().join("bad.toml");
    std::fs::write(
        &path,
        "[[servers]]\nname = \"x\"\ntransport = \"carrier-pigeon\"\nendpoint = \"coop\"\n",
    )
    .unwrap();
    let err = ConduitConfig::load(&path).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    std::fs::write(
        &path,
        "[[servers]]\nname = \"a\"\ntransport = \"http\"\nendpoint = \"http://localhost/mcp\"\n\
         [[servers]]\nname = \"a\"\ntransport = \"http\"\nendpoint = \"http://localhost/mcp\"\n",
    )
    .unwrap();
    let err = ConduitConfig::load(&path).await.unwrap_err();
    assert!(err.to_string().contains("duplicate"));
}
