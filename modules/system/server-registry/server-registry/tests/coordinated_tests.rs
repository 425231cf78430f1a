#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Liveness and failure handling of the coordinated backend, driven through an
//! in-process ensemble.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{ROOT, coordinated_on, detail, init_tracing, test_scope, wait_for_state};
use server_registry::{LocalEnsemble, RegistryClient, RetryPolicy};
use server_registry_sdk::{GetServersOptions, RegistryError, ServerRegistry, SessionState};

const TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Session loss
// =============================================================================

#[tokio::test]
async fn test_expired_session_removes_its_servers() {
    init_tracing();
    let ensemble = LocalEnsemble::new();
    let server = coordinated_on(&ensemble, TIMEOUT).await;
    let client = coordinated_on(&ensemble, TIMEOUT).await;
    let scope = test_scope();

    server
        .register_server(&scope, &detail("w1", "v1", "10.0.0.1:9000"))
        .await
        .unwrap();
    client
        .register_server(&scope, &detail("w2", "v1", "10.0.0.2:9000"))
        .await
        .unwrap();
    assert_eq!(
        client
            .get_servers(&scope, &GetServersOptions::unbounded())
            .await
            .unwrap()
            .len(),
        2
    );

    let mut state = server.subscribe();
    assert!(ensemble.expire_session(&server.session_id().unwrap()));
    wait_for_state(&mut state, SessionState::Expired).await;

    let remaining = client
        .get_servers(&scope, &GetServersOptions::unbounded())
        .await
        .unwrap();
    assert_eq!(remaining, vec![detail("w2", "v1", "10.0.0.2:9000")]);
    assert!(
        client
            .lookup_servers(&scope, &["w1".to_owned()])
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_expired_session_reports_unavailable_until_reconnect() {
    init_tracing();
    let ensemble = LocalEnsemble::new();
    let server = coordinated_on(&ensemble, TIMEOUT).await;
    let scope = test_scope();
    server
        .register_server(&scope, &detail("w1", "v1", "10.0.0.1:9000"))
        .await
        .unwrap();

    let old_session = server.session_id().unwrap();
    ensemble.expire_session(&old_session);

    let err = server
        .register_server(&scope, &detail("w1", "v2", "10.0.0.1:9000"))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Unavailable(_)), "{err:?}");
    assert!(err.is_retryable());
    assert!(matches!(
        server.get_servers(&scope, &GetServersOptions::unbounded()).await,
        Err(RegistryError::Unavailable(_))
    ));

    server.reconnect().await.unwrap();
    assert_ne!(server.session_id().unwrap(), old_session);
    assert_eq!(server.session_state(), SessionState::Connected);

    // Nothing is re-registered implicitly.
    assert!(
        server
            .get_servers(&scope, &GetServersOptions::unbounded())
            .await
            .unwrap()
            .is_empty()
    );

    for (scope, detail) in server.owned_registrations() {
        server.register_server(&scope, &detail).await.unwrap();
    }
    assert_eq!(
        server
            .get_servers(&scope, &GetServersOptions::unbounded())
            .await
            .unwrap(),
        vec![detail("w1", "v1", "10.0.0.1:9000")]
    );
    assert_eq!(ensemble.live_sessions(), 1);
}

#[tokio::test]
async fn test_partition_is_unavailable_and_heals_without_reconnect() {
    init_tracing();
    let ensemble = LocalEnsemble::new();
    let registry = coordinated_on(&ensemble, TIMEOUT).await;
    let scope = test_scope();
    registry
        .register_server(&scope, &detail("w1", "v1", "10.0.0.1:9000"))
        .await
        .unwrap();
    let mut state = registry.subscribe();

    ensemble.set_available(false);
    wait_for_state(&mut state, SessionState::Disconnected).await;
    assert!(matches!(
        registry
            .get_servers(&scope, &GetServersOptions::unbounded())
            .await,
        Err(RegistryError::Unavailable(_))
    ));
    assert!(matches!(
        registry.reconnect().await,
        Err(RegistryError::Unavailable(_))
    ));

    ensemble.set_available(true);
    wait_for_state(&mut state, SessionState::Connected).await;
    assert_eq!(
        registry
            .get_servers(&scope, &GetServersOptions::unbounded())
            .await
            .unwrap(),
        vec![detail("w1", "v1", "10.0.0.1:9000")]
    );
}

// =============================================================================
// Timeouts and cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_slow_service_times_out_and_session_survives() {
    init_tracing();
    let ensemble = LocalEnsemble::new();
    let registry = coordinated_on(&ensemble, Duration::from_millis(50)).await;
    let scope = test_scope();

    ensemble.set_latency(Duration::from_millis(500));
    assert!(matches!(
        registry
            .register_server(&scope, &detail("w1", "v1", "10.0.0.1:9000"))
            .await,
        Err(RegistryError::Registration(_))
    ));
    assert!(matches!(
        registry
            .get_servers(&scope, &GetServersOptions::unbounded())
            .await,
        Err(RegistryError::Unavailable(_))
    ));
    assert!(matches!(
        registry.lookup_servers(&scope, &["w1".to_owned()]).await,
        Err(RegistryError::Unavailable(_))
    ));

    ensemble.set_latency(Duration::ZERO);
    registry
        .register_server(&scope, &detail("w1", "v1", "10.0.0.1:9000"))
        .await
        .unwrap();
    assert_eq!(registry.session_state(), SessionState::Connected);
    assert_eq!(ensemble.live_sessions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_call_leaves_registry_usable() {
    init_tracing();
    let ensemble = LocalEnsemble::new();
    let registry = Arc::new(coordinated_on(&ensemble, Duration::from_secs(10)).await);
    let scope = test_scope();

    ensemble.set_latency(Duration::from_secs(5));
    let pending = {
        let registry = Arc::clone(&registry);
        let scope = scope.clone();
        tokio::spawn(async move {
            registry
                .register_server(&scope, &detail("w1", "v1", "10.0.0.1:9000"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    pending.abort();
    assert!(pending.await.unwrap_err().is_cancelled());

    ensemble.set_latency(Duration::ZERO);
    registry
        .register_server(&scope, &detail("w2", "v1", "10.0.0.2:9000"))
        .await
        .unwrap();
    assert_eq!(
        registry
            .get_servers(&scope, &GetServersOptions::unbounded())
            .await
            .unwrap(),
        vec![detail("w2", "v1", "10.0.0.2:9000")]
    );
    // The aborted registration never completed, so it is not tracked.
    assert_eq!(registry.owned_registrations().len(), 1);
}

// =============================================================================
// Stored values
// =============================================================================

#[tokio::test]
async fn test_unreadable_entries_are_skipped() {
    init_tracing();
    let ensemble = LocalEnsemble::new();
    let registry = coordinated_on(&ensemble, TIMEOUT).await;
    let scope = test_scope();
    let base = format!("{ROOT}/default/default");

    registry
        .register_server(&scope, &detail("good", "v1", "10.0.0.1:9000"))
        .await
        .unwrap();
    ensemble.put_persistent(&format!("{base}/garbage"), "not json");
    ensemble.put_persistent(
        &format!("{base}/blank"),
        r#"{"version":1,"runningVersion":"","hostAndPort":"10.0.0.3:9000"}"#,
    );
    ensemble.put_persistent(
        &format!("{base}/newer"),
        r#"{"version":2,"runningVersion":"v9","hostAndPort":"10.0.0.4:9000","zone":"b"}"#,
    );

    let servers = registry
        .get_servers(&scope, &GetServersOptions::unbounded())
        .await
        .unwrap();
    assert_eq!(
        servers,
        vec![
            detail("good", "v1", "10.0.0.1:9000"),
            detail("newer", "v9", "10.0.0.4:9000"),
        ]
    );

    let looked_up = registry
        .lookup_servers(
            &scope,
            &["garbage".to_owned(), "blank".to_owned(), "newer".to_owned()],
        )
        .await
        .unwrap();
    assert_eq!(looked_up, vec![detail("newer", "v9", "10.0.0.4:9000")]);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_close_releases_session_and_publishes_closed() {
    init_tracing();
    let ensemble = LocalEnsemble::new();
    let server = coordinated_on(&ensemble, TIMEOUT).await;
    let observer = coordinated_on(&ensemble, TIMEOUT).await;
    let scope = test_scope();
    server
        .register_server(&scope, &detail("w1", "v1", "10.0.0.1:9000"))
        .await
        .unwrap();
    let mut state = server.subscribe();

    server.close().await.unwrap();

    wait_for_state(&mut state, SessionState::Closed).await;
    assert_eq!(server.session_id(), None);
    assert!(
        observer
            .get_servers(&scope, &GetServersOptions::unbounded())
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(ensemble.live_sessions(), 1);
}

#[tokio::test]
async fn test_reconnect_closes_the_previous_session() {
    init_tracing();
    let ensemble = LocalEnsemble::new();
    let registry = coordinated_on(&ensemble, TIMEOUT).await;
    let mut state = registry.subscribe();

    registry.reconnect().await.unwrap();
    registry.reconnect().await.unwrap();

    assert_eq!(ensemble.live_sessions(), 1);
    assert_eq!(*state.borrow_and_update(), SessionState::Connected);
    assert_eq!(registry.session_state(), SessionState::Connected);
}

// =============================================================================
// Client retry loop
// =============================================================================

#[tokio::test]
async fn test_register_with_retry_reconnects_after_expiry() {
    init_tracing();
    let ensemble = LocalEnsemble::new();
    let registry = Arc::new(coordinated_on(&ensemble, TIMEOUT).await);
    let session = registry.session_id().unwrap();
    let client = RegistryClient::new(registry.clone()).with_timeout(TIMEOUT);
    let scope = client.scope("c1");

    ensemble.expire_session(&session);
    client
        .register_with_retry(
            &scope,
            &detail("w1", "v1", "10.0.0.1:9000"),
            &RetryPolicy::new(3).with_base_backoff(Duration::from_millis(10)),
        )
        .await
        .unwrap();

    assert_ne!(registry.session_id().unwrap(), session);
    assert_eq!(
        client
            .lookup_servers(&scope, &["w1".to_owned()])
            .await
            .unwrap(),
        vec![detail("w1", "v1", "10.0.0.1:9000")]
    );
}

#[tokio::test]
async fn test_register_with_retry_gives_up_during_partition() {
    init_tracing();
    let ensemble = LocalEnsemble::new();
    let registry = Arc::new(coordinated_on(&ensemble, TIMEOUT).await);
    let client = RegistryClient::new(registry);
    let scope = client.scope("c1");

    ensemble.set_available(false);
    let err = client
        .register_with_retry(
            &scope,
            &detail("w1", "v1", "10.0.0.1:9000"),
            &RetryPolicy::new(2).with_base_backoff(Duration::from_millis(5)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Unavailable(_)), "{err:?}");
}

#[tokio::test]
async fn test_register_with_retry_stops_on_closed() {
    init_tracing();
    let ensemble = LocalEnsemble::new();
    let client = RegistryClient::new(Arc::new(coordinated_on(&ensemble, TIMEOUT).await));
    client.close().await.unwrap();

    let err = client
        .register_with_retry(
            &client.scope("c1"),
            &detail("w1", "v1", "10.0.0.1:9000"),
            &RetryPolicy::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err, RegistryError::Closed);
}
