//! Process-local registry.
//!
//! Entries never expire: a record stays until the same server id registers
//! again or the registry is closed. Presence means live.

use async_trait::async_trait;
use dashmap::DashMap;
use server_registry_sdk::{
    GetServersOptions, RegistryError, RegistryKind, RegistryScope, ServerDetail, ServerRegistry,
    SessionState,
};
use tokio::sync::watch;

use super::Lifecycle;
use crate::domain::{dedupe_ids, select_servers};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ServerKey {
    scope: RegistryScope,
    server_id: String,
}

impl ServerKey {
    fn new(scope: &RegistryScope, server_id: &str) -> Self {
        Self {
            scope: scope.clone(),
            server_id: server_id.to_owned(),
        }
    }
}

/// Registry backed by a concurrent map keyed by `(scope, server_id)`.
#[derive(Debug)]
pub struct InMemoryRegistry {
    servers: DashMap<ServerKey, ServerDetail>,
    lifecycle: Lifecycle,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
            lifecycle: Lifecycle::new(),
        }
    }
}

#[async_trait]
impl ServerRegistry for InMemoryRegistry {
    fn kind(&self) -> RegistryKind {
        RegistryKind::InMemory
    }

    async fn register_server(
        &self,
        scope: &RegistryScope,
        detail: &ServerDetail,
    ) -> Result<(), RegistryError> {
        self.lifecycle.ensure_open()?;
        scope.validate()?;
        detail.validate()?;

        let previous = self
            .servers
            .insert(ServerKey::new(scope, detail.server_id()), detail.clone());
        tracing::debug!(
            %scope,
            server_id = detail.server_id(),
            running_version = detail.running_version(),
            replaced = previous.is_some(),
            "server registered"
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

        let candidates = self
            .servers
            .iter()
            .filter(|entry| entry.key().scope == *scope)
            .map(|entry| entry.value().clone())
            .collect();
        Ok(select_servers(candidates, options))
    }

    async fn lookup_servers(
        &self,
        scope: &RegistryScope,
        server_ids: &[String],
    ) -> Result<Vec<ServerDetail>, RegistryError> {
        self.lifecycle.ensure_open()?;
        scope.validate()?;

        Ok(dedupe_ids(server_ids)
            .into_iter()
            .filter_map(|id| {
                self.servers
                    .get(&ServerKey::new(scope, id))
                    .map(|entry| entry.value().clone())
            })
            .collect())
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
        if self.lifecycle.mark_closed() {
            self.servers.clear();
            tracing::debug!("in-memory registry closed");
        }
        Ok(())
    }
}
