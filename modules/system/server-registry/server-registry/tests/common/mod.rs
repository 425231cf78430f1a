#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

//! Shared fixtures for registry integration tests.

use std::sync::{Arc, Once};
use std::time::Duration;

use server_registry::{CoordinatedRegistry, InMemoryRegistry, LocalEnsemble, StandaloneRegistry};
use server_registry_sdk::{
    DEFAULT_TEST_CLUSTER, RegistryScope, ServerDetail, ServerRegistry, SessionState,
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

pub const ROOT: &str = "/server-registry";

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once per binary. `RUST_LOG` controls
/// verbosity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A backend under test plus the ensemble behind it, when there is one.
pub struct Harness {
    pub name: &'static str,
    pub registry: Arc<dyn ServerRegistry>,
    pub ensemble: Option<LocalEnsemble>,
}

pub fn test_scope() -> RegistryScope {
    RegistryScope::in_default_data_center(DEFAULT_TEST_CLUSTER)
}

pub fn detail(id: &str, version: &str, host_and_port: &str) -> ServerDetail {
    ServerDetail::new(id, version, host_and_port)
}

pub async fn coordinated_on(ensemble: &LocalEnsemble, timeout: Duration) -> CoordinatedRegistry {
    CoordinatedRegistry::connect(Arc::new(ensemble.connector()), ROOT, timeout)
        .await
        .expect("connect to local ensemble")
}

/// Backends that accept dynamic registrations.
pub async fn dynamic_backends() -> Vec<Harness> {
    init_tracing();
    let ensemble = LocalEnsemble::new();
    let coordinated = coordinated_on(&ensemble, Duration::from_secs(2)).await;
    vec![
        Harness {
            name: "inmemory",
            registry: Arc::new(InMemoryRegistry::new()),
            ensemble: None,
        },
        Harness {
            name: "coordinated",
            registry: Arc::new(coordinated),
            ensemble: Some(ensemble),
        },
    ]
}

/// Every backend, including the fixed standalone one.
pub async fn all_backends() -> Vec<Harness> {
    let mut backends = dynamic_backends().await;
    backends.push(Harness {
        name: "standalone",
        registry: Arc::new(
            StandaloneRegistry::new(detail("solo", "0", "10.0.0.100:9000")).unwrap(),
        ),
        ensemble: None,
    });
    backends
}

/// Wait until `rx` reports `expected`, failing the test after a second.
pub async fn wait_for_state(rx: &mut watch::Receiver<SessionState>, expected: SessionState) {
    tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|s| *s == expected))
        .await
        .unwrap_or_else(|_| panic!("state never became {expected:?}"))
        .expect("state channel closed");
}
