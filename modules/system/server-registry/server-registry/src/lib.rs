//! Server Registry
//!
//! Service discovery for shuffle servers: servers announce themselves with
//! `register_server`, clients find live servers with `get_servers` and
//! `lookup_servers`. Three backends share one contract
//! ([`server_registry_sdk::ServerRegistry`]):
//!
//! - [`InMemoryRegistry`] - process-local, for tests and single-process runs
//! - [`StandaloneRegistry`] - one fixed server
//! - [`CoordinatedRegistry`] - ephemeral nodes on a coordination service
//!
//! [`RegistryFactory`] builds a backend from [`RegistryConfig`];
//! [`RegistryClient`] is the facade callers hold.
//!
//! ```ignore
//! let config = RegistryConfig::load(Some(Path::new("registry.yaml")))?;
//! let client = RegistryClient::from_config(&config).await?;
//! let scope = client.scope("c1");
//!
//! client
//!     .register_with_retry(&scope, &ServerDetail::new("w1", "v1", "10.0.0.1:9000"), &RetryPolicy::default())
//!     .await?;
//! let servers = client.get_servers(&scope, &GetServersOptions::unbounded()).await?;
//! ```

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod backends;
pub mod client;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod factory;

pub use backends::{CoordinatedRegistry, InMemoryRegistry, StandaloneRegistry};
pub use client::{RegistryClient, RetryPolicy};
pub use config::{CoordinatedConfig, RegistryConfig, StandaloneConfig};
pub use coordination::{
    CoordinationConnector, CoordinationError, CoordinationSession, EtcdConnector, LocalEnsemble,
};
pub use factory::RegistryFactory;
