//! Full plugin lifecycle against the reference test plugin binary.

use std::sync::Arc;

use bridge_integration_tests::{TestSource, TestSourceHandle};
use bridge_message::{Metadata, RunnerMessage};
use bridge_plugin::{PluginConfig, PluginManager, PluginRunner, PluginState};
use bridge_runner::Runner;
use bytes::Bytes;
use serde_json::json;

fn plugin_config(name: &str, protocol: &str) -> PluginConfig {
    serde_json::from_value(json!({
        "name": name,
        "exec": env!("CARGO_BIN_EXE_test-plugin"),
        "protocol": protocol,
        "retry": 40,
        "delay": 50,
        "timeout": 2000,
        "statusInterval": 200,
    }))
    .unwrap()
}

#[tokio::test]
async fn test_unix_plugin_lifecycle() {
    bridge_integration_tests::init_tracing();
    let manager = PluginManager::new();
    let plugin = manager
        .create_plugin(plugin_config("e2e-unix", "unix"))
        .unwrap();

    plugin.start().await.unwrap();
    assert_eq!(plugin.state(), PluginState::Ready);

    // Runner RPC transforms and tags.
    let metadata = Metadata::try_from_pairs([("k", "v")]).unwrap();
    let envelope = plugin
        .runner_call(b"msg-1", &metadata, b"payload")
        .await
        .unwrap();
    assert_eq!(envelope.data, Bytes::from_static(b"plugged:payload"));
    assert_eq!(envelope.metadata.get("plugin"), Some("test"));
    assert_eq!(envelope.metadata.get("k"), Some("v"));

    // Target RPC delivers without error.
    plugin
        .target_call(b"msg-1", &metadata, b"payload")
        .await
        .unwrap();

    // Source stream yields the plugin's events in order, then closes.
    let (mut rx, handle) = plugin.source(8, Vec::new()).await.unwrap();
    for seq in 0..3 {
        let event = rx.recv().await.unwrap();
        assert_eq!(event.metadata.get("seq"), Some(seq.to_string().as_str()));
        assert_eq!(event.data, Bytes::from(format!("event-{seq}")));
    }
    assert!(rx.recv().await.is_none());
    // A clean end-of-stream records no failure on the handle.
    assert!(handle.take_failure().is_none());
    handle.close();
    handle.close(); // idempotent

    manager.stop_all().await;
    assert_eq!(plugin.state(), PluginState::Shutdown);
}

#[tokio::test]
async fn test_tcp_plugin_round_trip() {
    let manager = PluginManager::new();
    let plugin = manager
        .create_plugin(plugin_config("e2e-tcp", "tcp"))
        .unwrap();

    plugin.start().await.unwrap();
    let envelope = plugin
        .runner_call(b"msg-2", &Metadata::new(), b"over tcp")
        .await
        .unwrap();
    assert_eq!(envelope.data, Bytes::from_static(b"plugged:over tcp"));

    manager.stop_all().await;
}

#[tokio::test]
async fn test_plugin_runner_in_chain() {
    let manager = PluginManager::new();
    let plugin = manager
        .get_or_create_plugin(plugin_config("e2e-chain", "unix"), true)
        .await
        .unwrap();

    let runner = PluginRunner::new(Arc::clone(&plugin));
    let source = TestSource::new(
        "chained",
        Metadata::try_from_pairs([("origin", "test")]).unwrap(),
        Bytes::from_static(b"data"),
    );
    let mut msg = RunnerMessage::new(Arc::new(TestSourceHandle(source)));

    runner.process(&mut msg).await.unwrap();
    assert_eq!(msg.data().await.unwrap(), Bytes::from_static(b"plugged:data"));
    let metadata = msg.metadata().await.unwrap();
    assert_eq!(metadata.get("plugin"), Some("test"));
    assert_eq!(metadata.get("origin"), Some("test"));

    manager.stop_all().await;
}

#[tokio::test]
async fn test_hash_mismatch_blocks_start() {
    let manager = PluginManager::new();
    let mut config = plugin_config("e2e-hash", "unix");
    config.verify_hash = true;
    config.expected_sha256 = Some("0".repeat(64));

    let plugin = manager.create_plugin(config).unwrap();
    let err = plugin.start().await.unwrap_err();
    assert!(err.to_string().contains("security validation failed"));
    assert_eq!(plugin.state(), PluginState::Error);
}
