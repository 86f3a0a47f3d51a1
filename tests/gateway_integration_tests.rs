use plugin_gateway::config::{self, Config};
use plugin_gateway::discovery::{DiscoveryRegistry, InMemoryRegistry, PluginEventKind};
use plugin_gateway::plugin::{
    DefaultPluginLoader, LoaderLimits, PluginConfig, PluginEndpoint, PluginRequest, PluginStatus,
    RuntimeKind,
};
use plugin_gateway::web;
use plugin_gateway::PluginGateway;
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use warp::test::request;

fn echo_gateway(config: Config) -> (Arc<PluginGateway>, Arc<InMemoryRegistry>) {
    let registry = Arc::new(InMemoryRegistry::new());
    let loader = Arc::new(DefaultPluginLoader::with_builtins(LoaderLimits::default()));
    let gateway = PluginGateway::new(config, registry.clone(), loader).expect("valid config");
    (Arc::new(gateway), registry)
}

fn script_plugin() -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    let script = r#"
while IFS= read -r line; do
  case "$line" in
    *'"kind":"health"'*)
      echo '{"health":{"status":"healthy","message":"ok","timestamp":"2025-01-01T00:00:00Z","details":{}}}' ;;
    *'"kind":"request"'*)
      echo '{"response":{"status_code":202,"headers":{"x-plugin":"script"},"body":{"accepted":true},"metadata":{},"timestamp":"2025-01-01T00:00:00Z"}}' ;;
    *'"kind":"shutdown"'*) exit 0 ;;
    *) echo '{}' ;;
  esac
done
"#;
    file.write_all(script.as_bytes()).expect("write script");
    file
}

#[tokio::test]
async fn echo_plugin_end_to_end() {
    let mut config = Config::default();
    config.plugins = vec![PluginConfig::native("echo", "echo")];
    let (gateway, registry) = echo_gateway(config);
    let mut events = registry.watch_plugins();

    gateway.start().await.expect("gateway starts");

    let resp = gateway
        .handle_request(PluginRequest::new("POST", "/api/echo/ping").with_body(json!({"n": 1})))
        .await
        .expect("echo answers");
    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.body["path"], "/api/echo/ping");
    assert_eq!(resp.body["body"]["n"], 1);

    let event = events.recv().await.expect("registration event");
    assert_eq!(event.kind, PluginEventKind::Registered);
    assert_eq!(event.plugin_id, "echo");

    gateway.stop().await;
    assert_eq!(
        gateway.get_plugin_info("echo").await.unwrap().status,
        PluginStatus::Stopped
    );
}

#[tokio::test]
async fn unload_removes_plugin_from_every_view() {
    let (gateway, registry) = echo_gateway(Config::default());
    gateway
        .load_plugin("echo", PluginConfig::native("echo", "echo"))
        .await
        .unwrap();
    assert_eq!(registry.list_plugins().await.unwrap().len(), 1);

    gateway.unload_plugin("echo").await.unwrap();

    assert!(gateway.list_plugins().await.is_empty());
    assert!(registry.list_plugins().await.unwrap().is_empty());
    let err = gateway
        .handle_request(PluginRequest::new("GET", "/api/echo/ping"))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert_eq!(
        gateway.circuit_status("echo").await.unwrap_err().status_code(),
        404
    );
}

#[tokio::test]
async fn unknown_native_factory_fails_cleanly() {
    let (gateway, _) = echo_gateway(Config::default());
    let err = gateway
        .load_plugin("nope", PluginConfig::native("nope", "not-registered"))
        .await
        .unwrap_err();
    assert_eq!(err.reason(), "load_failed");
    assert!(gateway.list_plugins().await.is_empty());

    // The failed attempt does not hold a slot.
    gateway
        .load_plugin("echo", PluginConfig::native("echo", "echo"))
        .await
        .unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn process_plugin_served_over_http() {
    let script = script_plugin();
    let mut plugin = PluginConfig::native("script", "script");
    plugin.runtime = RuntimeKind::Process;
    plugin.path = Some(script.path().to_path_buf());
    plugin.metadata.insert("interpreter".into(), "sh".into());
    plugin.endpoints.push(PluginEndpoint {
        path: "/hooks/script".into(),
        method: "POST".into(),
        auth: false,
        rate_limit: 0,
        headers: HashMap::new(),
    });

    let (gateway, _) = echo_gateway(Config::default());
    gateway.load_plugin("script", plugin).await.expect("process plugin loads");
    let routes = web::create_routes(gateway.clone());

    let resp = request()
        .method("POST")
        .path("/hooks/script/run")
        .remote_addr("203.0.113.20:40000".parse().unwrap())
        .json(&json!({"job": 1}))
        .reply(&routes)
        .await;

    assert_eq!(resp.status(), 202);
    assert_eq!(resp.headers()["x-plugin"], "script");
    let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(body["accepted"], true);

    gateway.unload_plugin("script").await.unwrap();
}

#[tokio::test]
async fn config_file_drives_gateway() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    writeln!(
        file,
        r#"
maxPlugins = 4
pluginTimeoutMs = 2000

[circuitBreaker]
failureThreshold = 3

[routing]
prefix = "/svc"

[routing.routes]
"/legacy/echo" = "echo"

[[plugins]]
id = "echo"
name = "echo"
"#
    )
    .unwrap();

    let config = config::load_from_path(file.path()).await.expect("config loads");
    assert_eq!(config.max_plugins, 4);
    assert_eq!(config.circuit_breaker.failure_threshold, 3);

    let (gateway, _) = echo_gateway(config);
    gateway.start().await.unwrap();

    for path in ["/svc/echo/x", "/legacy/echo/y"] {
        let resp = gateway
            .handle_request(PluginRequest::new("GET", path))
            .await
            .unwrap_or_else(|e| panic!("{path}: {e}"));
        assert_eq!(resp.body["path"], path);
    }
    assert!(gateway
        .handle_request(PluginRequest::new("GET", "/api/echo/x"))
        .await
        .is_err());

    gateway.stop().await;
}
