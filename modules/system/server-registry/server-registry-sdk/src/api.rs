//! Public API trait for the server registry.
//!
//! Servers call [`ServerRegistry::register_server`] on startup and after every
//! reconnect; clients call [`ServerRegistry::get_servers`] or
//! [`ServerRegistry::lookup_servers`] before each shuffle operation and cache
//! the result for the duration of that operation.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::RegistryError;
use crate::models::{GetServersOptions, RegistryKind, RegistryScope, ServerDetail, SessionState};

/// Directory of live servers, scoped by data center and cluster.
///
/// Every backend honors the same contract:
///
/// - `register_server` is an idempotent upsert keyed by
///   `(scope, server_id)`. Registering the same id again supersedes the
///   previous record; no duplicates accumulate.
/// - `get_servers` and `lookup_servers` return only live records. An empty
///   list is a normal answer, not an error.
/// - A registration is visible to a later read issued through the same
///   instance. Visibility of other processes' writes is bounded by the
///   backend's own consistency model.
/// - `close` is idempotent; every other call after it fails with
///   [`RegistryError::Closed`].
///
/// All methods are safe to call concurrently.
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    /// Backend variant.
    fn kind(&self) -> RegistryKind;

    /// Create or replace the record for `detail.server_id()` in `scope`.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for empty fields
    /// - `Registration` if the backend could not record the entry; the caller
    ///   should retry with backoff
    /// - `Unavailable` if the backend session is lost
    /// - `Closed` after `close()`
    async fn register_server(
        &self,
        scope: &RegistryScope,
        detail: &ServerDetail,
    ) -> Result<(), RegistryError>;

    /// List live servers in `scope`, filtered by `options`.
    ///
    /// The result is deduplicated by server id, excludes every record whose
    /// host appears in `options.exclude_hosts`, and holds at most
    /// `options.max_count` entries. When truncation is needed, the subset is
    /// chosen uniformly at random. The returned list is sorted by server id.
    ///
    /// # Errors
    ///
    /// - `Unavailable` if the backend session is lost
    /// - `Closed` after `close()`
    async fn get_servers(
        &self,
        scope: &RegistryScope,
        options: &GetServersOptions,
    ) -> Result<Vec<ServerDetail>, RegistryError>;

    /// Return the live records for `server_ids`.
    ///
    /// Unknown ids are silently omitted. Duplicate ids yield one record.
    ///
    /// # Errors
    ///
    /// - `Unavailable` if the backend session is lost
    /// - `Closed` after `close()`
    async fn lookup_servers(
        &self,
        scope: &RegistryScope,
        server_ids: &[String],
    ) -> Result<Vec<ServerDetail>, RegistryError>;

    /// Current liveness of the backend session.
    fn session_state(&self) -> SessionState;

    /// Subscribe to session state transitions.
    ///
    /// Server processes watch this to learn when their ephemeral
    /// registrations are gone and must be replayed after [`Self::reconnect`].
    fn subscribe(&self) -> watch::Receiver<SessionState>;

    /// Replace the backend session with a fresh one.
    ///
    /// Backends without sessions accept the call as a no-op.
    ///
    /// # Errors
    ///
    /// - `Unavailable` if a new session cannot be opened
    /// - `Closed` after `close()`
    async fn reconnect(&self) -> Result<(), RegistryError>;

    /// Release all backend connections and sessions.
    ///
    /// Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Backends report release problems through logs; the call itself only
    /// fails if a backend cannot honor the close at all.
    async fn close(&self) -> Result<(), RegistryError>;
}
