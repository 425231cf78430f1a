//! Registry configuration.
//!
//! Loaded with `figment` from an optional YAML file, overridden by
//! `SERVER_REGISTRY_*` environment variables (nested keys split on `__`):
//!
//! ```yaml
//! type: coordinated
//! data_center: dc1
//! operation_timeout: 3s
//! coordinated:
//!   endpoints: ["http://10.0.0.5:2379"]
//!   root: /server-registry
//!   session_ttl: 10s
//! ```

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::{Deserialize, Serialize};
use server_registry_sdk::{DEFAULT_DATA_CENTER, RegistryError, RegistryKind, ServerDetail};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SERVER_REGISTRY_";

/// Top-level registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Backend type tag: `coordinated` (or `etcd`, `zookeeper`), `inmemory`
    /// (or `in-memory`), `standalone`.
    #[serde(rename = "type", default = "default_type")]
    pub registry_type: String,

    /// Data center used by `RegistryClient::scope`.
    #[serde(default = "default_data_center")]
    pub data_center: String,

    /// Upper bound on a single backend call.
    #[serde(default = "default_operation_timeout", with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Required for the coordinated backend.
    pub coordinated: Option<CoordinatedConfig>,

    /// Required for the standalone backend.
    pub standalone: Option<StandaloneConfig>,
}

fn default_type() -> String {
    RegistryKind::InMemory.as_str().to_owned()
}

fn default_data_center() -> String {
    DEFAULT_DATA_CENTER.to_owned()
}

fn default_operation_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_type: default_type(),
            data_center: default_data_center(),
            operation_timeout: default_operation_timeout(),
            coordinated: None,
            standalone: None,
        }
    }
}

/// Coordination-service connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatedConfig {
    /// Service endpoints, tried in order.
    pub endpoints: Vec<String>,

    /// Namespace root under which scopes are created.
    #[serde(default = "default_root")]
    pub root: String,

    /// How long the service keeps a silent session alive.
    #[serde(default = "default_session_ttl", with = "humantime_serde")]
    pub session_ttl: Duration,
}

fn default_root() -> String {
    "/server-registry".to_owned()
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(10)
}

impl Default for CoordinatedConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            root: default_root(),
            session_ttl: default_session_ttl(),
        }
    }
}

/// The one server a standalone registry reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StandaloneConfig {
    pub host_and_port: String,
    /// Defaults to `host_and_port`.
    pub server_id: Option<String>,
    /// Defaults to `"0"`.
    pub running_version: Option<String>,
}

impl StandaloneConfig {
    #[must_use]
    pub fn server_detail(&self) -> ServerDetail {
        ServerDetail::new(
            self.server_id
                .clone()
                .unwrap_or_else(|| self.host_and_port.clone()),
            self.running_version.clone().unwrap_or_else(|| "0".to_owned()),
            self.host_and_port.clone(),
        )
    }
}

impl RegistryConfig {
    /// Load from an optional YAML file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the file is missing or any source fails
    /// to parse.
    pub fn load(path: Option<&Path>) -> Result<Self, RegistryError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.is_file() {
                return Err(RegistryError::Configuration(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }
        Self::extract(&figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Parse a YAML document without consulting the environment.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the document does not parse.
    pub fn from_yaml(yaml: &str) -> Result<Self, RegistryError> {
        Self::extract(&Figment::new().merge(Yaml::string(yaml)))
    }

    fn extract(figment: &Figment) -> Result<Self, RegistryError> {
        figment
            .extract()
            .map_err(|e| RegistryError::Configuration(e.to_string()))
    }

    /// Parsed backend type.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an unknown tag.
    pub fn kind(&self) -> Result<RegistryKind, RegistryError> {
        self.registry_type.parse()
    }

    /// Check that the section required by the selected backend is present and
    /// usable.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the first problem found.
    pub fn validate(&self) -> Result<RegistryKind, RegistryError> {
        let kind = self.kind()?;
        if self.data_center.trim().is_empty() || self.data_center.contains('/') {
            return Err(RegistryError::Configuration(format!(
                "invalid data_center '{}'",
                self.data_center
            )));
        }
        if self.operation_timeout.is_zero() {
            return Err(RegistryError::Configuration(
                "operation_timeout must be greater than zero".to_owned(),
            ));
        }

        match kind {
            RegistryKind::InMemory => {}
            RegistryKind::Coordinated => {
                let section = self.coordinated.as_ref().ok_or_else(|| missing("coordinated"))?;
                if section.endpoints.iter().all(|e| e.trim().is_empty()) {
                    return Err(RegistryError::Configuration(
                        "coordinated.endpoints must list at least one endpoint".to_owned(),
                    ));
                }
                if section.session_ttl < Duration::from_secs(1) {
                    return Err(RegistryError::Configuration(
                        "coordinated.session_ttl must be at least 1s".to_owned(),
                    ));
                }
            }
            RegistryKind::Standalone => {
                let section = self.standalone.as_ref().ok_or_else(|| missing("standalone"))?;
                if section.host_and_port.trim().is_empty() {
                    return Err(RegistryError::Configuration(
                        "standalone.host_and_port is required".to_owned(),
                    ));
                }
            }
        }
        Ok(kind)
    }
}

fn missing(section: &str) -> RegistryError {
    RegistryError::Configuration(format!("missing '{section}' section for this registry type"))
}
