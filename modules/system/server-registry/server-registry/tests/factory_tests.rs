#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Building registries from configuration, including the etcd-backed one
//! against a mocked gateway.

mod common;

use std::io::Write;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::{detail, init_tracing};
use httpmock::prelude::*;
use serde_json::json;
use server_registry::{RegistryClient, RegistryConfig, RegistryFactory};
use server_registry_sdk::{GetServersOptions, RegistryError, RegistryKind, ServerRegistry};

fn coordinated_config(endpoint: &str) -> RegistryConfig {
    RegistryConfig::from_yaml(&format!(
        "type: etcd\ndata_center: dc1\noperation_timeout: 2s\ncoordinated:\n  endpoints: ['{endpoint}']\n  root: /sr\n  session_ttl: 30s\n"
    ))
    .unwrap()
}

#[tokio::test]
async fn test_coordinated_registry_over_etcd_gateway() {
    init_tracing();
    let server = MockServer::start();
    let grant = server.mock(|when, then| {
        when.method(POST)
            .path("/v3/lease/grant")
            .json_body(json!({"TTL": 30}));
        then.status(200)
            .json_body(json!({"ID": "7587862337578830351", "TTL": "30"}));
    });
    let put = server.mock(|when, then| {
        when.method(POST).path("/v3/kv/put").json_body(json!({
            "key": BASE64.encode("/sr/dc1/c1/w1"),
            "value": BASE64.encode(r#"{"version":1,"runningVersion":"v1","hostAndPort":"10.0.0.1:9000"}"#),
            "lease": "7587862337578830351"
        }));
        then.status(200).json_body(json!({"header": {"revision": "2"}}));
    });
    let range = server.mock(|when, then| {
        when.method(POST).path("/v3/kv/range").json_body(json!({
            "key": BASE64.encode("/sr/dc1/c1/"),
            "range_end": BASE64.encode("/sr/dc1/c10"),
        }));
        then.status(200).json_body(json!({
            "kvs": [
                {
                    "key": BASE64.encode("/sr/dc1/c1/w1"),
                    "value": BASE64.encode(r#"{"version":1,"runningVersion":"v1","hostAndPort":"10.0.0.1:9000"}"#)
                },
                {
                    "key": BASE64.encode("/sr/dc1/c1/w2"),
                    "value": BASE64.encode("garbage")
                }
            ],
            "count": "2"
        }));
    });
    let revoke = server.mock(|when, then| {
        when.method(POST)
            .path("/v3/lease/revoke")
            .json_body(json!({"ID": "7587862337578830351"}));
        then.status(200).json_body(json!({"header": {}}));
    });

    let client = RegistryClient::from_config(&coordinated_config(&server.base_url()))
        .await
        .unwrap();
    assert_eq!(client.kind(), RegistryKind::Coordinated);
    let scope = client.scope("c1");

    client
        .register_server(&scope, &detail("w1", "v1", "10.0.0.1:9000"))
        .await
        .unwrap();
    let servers = client
        .get_servers(&scope, &GetServersOptions::unbounded())
        .await
        .unwrap();
    assert_eq!(servers, vec![detail("w1", "v1", "10.0.0.1:9000")]);

    client.close().await.unwrap();
    client.close().await.unwrap();

    grant.assert();
    put.assert();
    range.assert();
    revoke.assert_calls(1);
}

#[tokio::test]
async fn test_unreachable_etcd_is_unavailable() {
    init_tracing();
    let result = RegistryFactory::create(&coordinated_config("http://127.0.0.1:9")).await;
    assert!(matches!(result, Err(RegistryError::Unavailable(_))));
}

#[tokio::test]
async fn test_client_from_yaml_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.yaml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(
        file,
        "type: standalone\ndata_center: dc3\nstandalone:\n  host_and_port: '10.9.9.9:7000'\n  server_id: solo"
    )
    .unwrap();

    let config = temp_env::with_vars_unset(
        ["SERVER_REGISTRY_TYPE", "SERVER_REGISTRY_DATA_CENTER"],
        || RegistryConfig::load(Some(&path)),
    )
    .unwrap();
    let client = RegistryClient::from_config(&config).await.unwrap();

    assert_eq!(client.kind(), RegistryKind::Standalone);
    assert_eq!(client.data_center(), "dc3");
    let servers = client
        .get_servers(&client.scope("any"), &GetServersOptions::unbounded())
        .await
        .unwrap();
    assert_eq!(servers, vec![detail("solo", "0", "10.9.9.9:7000")]);
}

#[tokio::test]
async fn test_type_tags_and_aliases() {
    init_tracing();
    for (tag, kind) in [
        ("inmemory", RegistryKind::InMemory),
        ("in-memory", RegistryKind::InMemory),
        ("IN-MEMORY", RegistryKind::InMemory),
    ] {
        let config = RegistryConfig {
            registry_type: tag.to_owned(),
            ..RegistryConfig::default()
        };
        let registry = RegistryFactory::create(&config).await.unwrap();
        assert_eq!(registry.kind(), kind, "{tag}");
    }

    let config = RegistryConfig {
        registry_type: "consul".to_owned(),
        ..RegistryConfig::default()
    };
    let Err(err) = RegistryFactory::create(&config).await else {
        panic!("unknown type tag must be rejected");
    };
    assert!(matches!(err, RegistryError::Configuration(ref m) if m.contains("consul")), "{err:?}");
    assert!(!err.is_retryable());
}
