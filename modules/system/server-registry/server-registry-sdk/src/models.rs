//! Domain models shared by every registry backend.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Data center used when the caller does not name one.
pub const DEFAULT_DATA_CENTER: &str = "default";

/// Cluster name for tests and test tooling only. Production callers always
/// name their cluster.
pub const DEFAULT_TEST_CLUSTER: &str = "default";

/// Type tag of the coordination-service backend.
pub const TYPE_COORDINATED: &str = "coordinated";
/// Type tag of the in-memory backend.
pub const TYPE_INMEMORY: &str = "inmemory";
/// Type tag of the standalone backend.
pub const TYPE_STANDALONE: &str = "standalone";

/// All accepted canonical type tags.
pub const VALID_TYPES: [&str; 3] = [TYPE_COORDINATED, TYPE_INMEMORY, TYPE_STANDALONE];

/// Backend variant behind a registry instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Coordinated,
    InMemory,
    Standalone,
}

impl RegistryKind {
    /// Canonical type tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Coordinated => TYPE_COORDINATED,
            Self::InMemory => TYPE_INMEMORY,
            Self::Standalone => TYPE_STANDALONE,
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistryKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coordinated" | "etcd" | "zookeeper" => Ok(Self::Coordinated),
            "inmemory" | "in-memory" => Ok(Self::InMemory),
            "standalone" => Ok(Self::Standalone),
            other => Err(RegistryError::Configuration(format!(
                "unknown registry type '{other}', expected one of: {}",
                VALID_TYPES.join(", ")
            ))),
        }
    }
}

/// Liveness of the backend session as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Operations are served.
    Connected,
    /// Transient loss; the session may recover without losing registrations.
    Disconnected,
    /// The backend dropped the session and every ephemeral registration it
    /// owned. A reconnect and re-registration are required.
    Expired,
    /// The registry was closed.
    Closed,
}

impl SessionState {
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// The `(data_center, cluster)` pair under which registrations are grouped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistryScope {
    data_center: String,
    cluster: String,
}

impl RegistryScope {
    #[must_use]
    pub fn new(data_center: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            data_center: data_center.into(),
            cluster: cluster.into(),
        }
    }

    /// Scope in [`DEFAULT_DATA_CENTER`].
    #[must_use]
    pub fn in_default_data_center(cluster: impl Into<String>) -> Self {
        Self::new(DEFAULT_DATA_CENTER, cluster)
    }

    #[must_use]
    pub fn data_center(&self) -> &str {
        &self.data_center
    }

    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Check that both parts are usable as key segments.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidArgument`] for an empty part or a part
    /// containing `/`.
    pub fn validate(&self) -> Result<(), RegistryError> {
        validate_segment("data_center", &self.data_center)?;
        validate_segment("cluster", &self.cluster)
    }
}

impl fmt::Display for RegistryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.data_center, self.cluster)
    }
}

/// One registered server as handed out to callers.
///
/// Values are always owned copies; nothing returned by a registry aliases its
/// internal state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerDetail {
    server_id: String,
    running_version: String,
    host_and_port: String,
}

impl ServerDetail {
    #[must_use]
    pub fn new(
        server_id: impl Into<String>,
        running_version: impl Into<String>,
        host_and_port: impl Into<String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            running_version: running_version.into(),
            host_and_port: host_and_port.into(),
        }
    }

    /// Stable identity of the logical server across restarts.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Changes on every restart of the server process.
    #[must_use]
    pub fn running_version(&self) -> &str {
        &self.running_version
    }

    #[must_use]
    pub fn host_and_port(&self) -> &str {
        &self.host_and_port
    }

    /// Host component of [`Self::host_and_port`].
    ///
    /// `"10.0.0.1:9000"` yields `"10.0.0.1"`, `"[::1]:9000"` yields `"::1"`,
    /// and a value without a port is returned unchanged.
    #[must_use]
    pub fn host(&self) -> &str {
        host_of(&self.host_and_port)
    }

    /// Check that the record can be registered.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidArgument`] when a field is empty or the
    /// server id contains `/`.
    pub fn validate(&self) -> Result<(), RegistryError> {
        validate_segment("server_id", &self.server_id)?;
        validate_non_empty("running_version", &self.running_version)?;
        validate_non_empty("host_and_port", &self.host_and_port)
    }
}

impl fmt::Display for ServerDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]@{}",
            self.server_id, self.running_version, self.host_and_port
        )
    }
}

/// Filters applied by `get_servers`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetServersOptions {
    /// Upper bound on the result size. `None` returns every live server.
    pub max_count: Option<usize>,
    /// Hosts to leave out, compared case-insensitively against
    /// [`ServerDetail::host`].
    pub exclude_hosts: Vec<String>,
}

impl GetServersOptions {
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = Some(max_count);
        self
    }

    #[must_use]
    pub fn excluding<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_hosts.extend(hosts.into_iter().map(Into::into));
        self
    }

    /// Whether `detail` is filtered out by `exclude_hosts`.
    #[must_use]
    pub fn excludes(&self, detail: &ServerDetail) -> bool {
        let host = detail.host();
        self.exclude_hosts
            .iter()
            .any(|h| host_of(h).eq_ignore_ascii_case(host))
    }
}

fn host_of(host_and_port: &str) -> &str {
    let s = host_and_port.trim();
    if let Some(rest) = s.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host);
    }
    match s.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address.
        Some((host, _)) if !host.contains(':') => host,
        _ => s,
    }
}

fn validate_non_empty(field: &str, value: &str) -> Result<(), RegistryError> {
    if value.trim().is_empty() {
        return Err(RegistryError::InvalidArgument(format!(
            "{field} must not be empty"
        )));
    }
    Ok(())
}

fn validate_segment(field: &str, value: &str) -> Result<(), RegistryError> {
    validate_non_empty(field, value)?;
    if value.contains('/') {
        return Err(RegistryError::InvalidArgument(format!(
            "{field} must not contain '/': {value}"
        )));
    }
    Ok(())
}
