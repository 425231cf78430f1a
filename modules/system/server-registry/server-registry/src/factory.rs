//! Backend construction from configuration.

use std::sync::Arc;

use server_registry_sdk::{RegistryError, RegistryKind, ServerRegistry};

use crate::backends::{CoordinatedRegistry, InMemoryRegistry, StandaloneRegistry};
use crate::config::{CoordinatedConfig, RegistryConfig};
use crate::coordination::{CoordinationConnector, EtcdConfig, EtcdConnector};

/// Builds the backend selected by [`RegistryConfig::registry_type`].
pub struct RegistryFactory;

impl RegistryFactory {
    /// Build a registry. The coordinated backend connects to the configured
    /// etcd endpoints before returning.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an unknown type or a missing section and
    /// `Unavailable` when the coordination service cannot be reached.
    pub async fn create(config: &RegistryConfig) -> Result<Arc<dyn ServerRegistry>, RegistryError> {
        let kind = config.validate()?;
        tracing::debug!(registry_type = %kind, data_center = %config.data_center, "creating registry");

        match kind {
            RegistryKind::InMemory => Ok(Arc::new(InMemoryRegistry::new())),
            RegistryKind::Standalone => {
                let section = config.standalone.as_ref().ok_or_else(|| {
                    RegistryError::Configuration("missing 'standalone' section".to_owned())
                })?;
                Ok(Arc::new(StandaloneRegistry::new(section.server_detail())?))
            }
            RegistryKind::Coordinated => {
                let section = config.coordinated.as_ref().ok_or_else(|| {
                    RegistryError::Configuration("missing 'coordinated' section".to_owned())
                })?;
                let connector = EtcdConnector::new(EtcdConfig {
                    endpoints: section
                        .endpoints
                        .iter()
                        .filter(|e| !e.trim().is_empty())
                        .cloned()
                        .collect(),
                    session_ttl: section.session_ttl,
                    request_timeout: config.operation_timeout,
                })
                .map_err(|e| RegistryError::Configuration(e.to_string()))?;
                Self::connect(config, section, Arc::new(connector)).await
            }
        }
    }

    /// Build a coordinated registry over an injected connector, e.g. a
    /// [`LocalEnsemble`](crate::coordination::LocalEnsemble). Endpoints in the
    /// configuration are ignored; the `coordinated` section is optional.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the configured type is not coordinated or
    /// the root is unusable, and `Unavailable` when no session can be opened.
    pub async fn create_with_connector(
        config: &RegistryConfig,
        connector: Arc<dyn CoordinationConnector>,
    ) -> Result<Arc<dyn ServerRegistry>, RegistryError> {
        let kind = config.kind()?;
        if kind != RegistryKind::Coordinated {
            return Err(RegistryError::Configuration(format!(
                "an injected connector needs registry type '{}', got '{kind}'",
                RegistryKind::Coordinated
            )));
        }
        let section = config.coordinated.clone().unwrap_or_default();
        Self::connect(config, &section, connector).await
    }

    async fn connect(
        config: &RegistryConfig,
        section: &CoordinatedConfig,
        connector: Arc<dyn CoordinationConnector>,
    ) -> Result<Arc<dyn ServerRegistry>, RegistryError> {
        let registry =
            CoordinatedRegistry::connect(connector, &section.root, config.operation_timeout)
                .await?;
        Ok(Arc::new(registry))
    }
}
