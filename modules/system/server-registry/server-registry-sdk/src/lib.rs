//! Server Registry SDK
//!
//! This crate provides the public API for the `server-registry` module:
//!
//! - [`ServerRegistry`] - Contract implemented by every registry backend
//! - [`ServerDetail`], [`RegistryScope`], [`GetServersOptions`] - Domain models
//! - [`SessionState`] - Observable liveness of a backend session
//! - [`RegistryError`] - Error types
//!
//! ## Usage
//!
//! ```ignore
//! use server_registry_sdk::{GetServersOptions, RegistryScope, ServerDetail, ServerRegistry};
//!
//! let scope = RegistryScope::in_default_data_center("c1");
//!
//! // Server side: announce this process
//! registry
//!     .register_server(&scope, &ServerDetail::new("w1", "v1", "10.0.0.1:9000"))
//!     .await?;
//!
//! // Client side: discover up to 10 servers, skipping one that already failed
//! let servers = registry
//!     .get_servers(&scope, &GetServersOptions::unbounded().with_max_count(10).excluding(["10.0.0.9"]))
//!     .await?;
//! ```

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod api;
pub mod error;
pub mod models;

pub use api::ServerRegistry;
pub use error::RegistryError;
pub use models::{
    DEFAULT_DATA_CENTER, DEFAULT_TEST_CLUSTER, GetServersOptions, RegistryKind, RegistryScope,
    ServerDetail, SessionState, TYPE_COORDINATED, TYPE_INMEMORY, TYPE_STANDALONE, VALID_TYPES,
};
