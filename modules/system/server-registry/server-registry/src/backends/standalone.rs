//! Single statically configured server.
//!
//! Models a one-node deployment where discovery is unnecessary. Every scope
//! resolves to the configured record; `register_server` validates its input
//! and is otherwise ignored, since the set of servers is fixed.

use async_trait::async_trait;
use server_registry_sdk::{
    GetServersOptions, RegistryError, RegistryKind, RegistryScope, ServerDetail, ServerRegistry,
    SessionState,
};
use tokio::sync::watch;

use super::Lifecycle;
use crate::domain::select_servers;

/// Registry that always answers with one fixed server.
#[derive(Debug)]
pub struct StandaloneRegistry {
    server: ServerDetail,
    lifecycle: Lifecycle,
}

impl StandaloneRegistry {
    /// # Errors
    ///
    /// Returns `Configuration` when `server` has empty fields.
    pub fn new(server: ServerDetail) -> Result<Self, RegistryError> {
        server
            .validate()
            .map_err(|e| RegistryError::Configuration(format!("standalone server: {e}")))?;
        Ok(Self {
            server,
            lifecycle: Lifecycle::new(),
        })
    }

    #[must_use]
    pub fn server(&self) -> &ServerDetail {
        &self.server
    }
}

#[async_trait]
impl ServerRegistry for StandaloneRegistry {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Standalone
    }

    async fn register_server(
        &self,
        scope: &RegistryScope,
        detail: &ServerDetail,
    ) -> Result<(), RegistryError> {
        self.lifecycle.ensure_open()?;
        scope.validate()?;
        detail.validate()?;
        tracing::debug!(
            %scope,
            server_id = detail.server_id(),
            "standalone registry ignores registration"
        );
        Ok(())
    }

    async fn get_servers(
        &self,
        scope: &RegistryScope,
        options: &GetServersOptions,
    ) -> Result<Vec<ServerDetail>, RegistryError> {
        self.lifecycle.ensure_open()?;
        scope.validate()?;
        Ok(select_servers(vec![self.server.clone()], options))
    }

    async fn lookup_servers(
        &self,
        scope: &RegistryScope,
        server_ids: &[String],
    ) -> Result<Vec<ServerDetail>, RegistryError> {
        self.lifecycle.ensure_open()?;
        scope.validate()?;
        if server_ids.iter().any(|id| id == self.server.server_id()) {
            Ok(vec![self.server.clone()])
        } else {
            Ok(Vec::new())
        }
    }

    fn session_state(&self) -> SessionState {
        self.lifecycle.state()
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.lifecycle.subscribe()
    }

    async fn reconnect(&self) -> Result<(), RegistryError> {
        self.lifecycle.ensure_open()
    }

    async fn close(&self) -> Result<(), RegistryError> {
        self.lifecycle.mark_closed();
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn registry() -> StandaloneRegistry {
        StandaloneRegistry::new(ServerDetail::new("solo", "0", "10.0.0.1:9000")).unwrap()
    }

    #[tokio::test]
    async fn test_registration_does_not_change_the_answer() {
        let registry = registry();
        let scope = RegistryScope::in_default_data_center("c1");

        registry
            .register_server(&scope, &ServerDetail::new("w2", "v1", "10.0.0.2:9000"))
            .await
            .unwrap();

        let servers = registry
            .get_servers(&scope, &GetServersOptions::unbounded())
            .await
            .unwrap();
        assert_eq!(servers, vec![ServerDetail::new("solo", "0", "10.0.0.1:9000")]);
    }

    #[tokio::test]
    async fn test_every_scope_sees_the_configured_server() {
        let registry = registry();
        for scope in [
            RegistryScope::in_default_data_center("c1"),
            RegistryScope::new("dc9", "other"),
        ] {
            let found = registry
                .lookup_servers(&scope, &["solo".to_owned(), "ghost".to_owned()])
                .await
                .unwrap();
            assert_eq!(found.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_filters_still_apply() {
        let registry = registry();
        let scope = RegistryScope::in_default_data_center("c1");

        let excluded = registry
            .get_servers(&scope, &GetServersOptions::unbounded().excluding(["10.0.0.1"]))
            .await
            .unwrap();
        assert!(excluded.is_empty());

        let none = registry
            .get_servers(&scope, &GetServersOptions::unbounded().with_max_count(0))
            .await
            .unwrap();
        assert!(none.is_empty());

        let unknown = registry
            .lookup_servers(&scope, &["ghost".to_owned()])
            .await
            .unwrap();
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_rejects_incomplete_server() {
        assert!(matches!(
            StandaloneRegistry::new(ServerDetail::new("solo", "0", "")),
            Err(RegistryError::Configuration(_))
        ));
    }
}
