//! Client facade over any registry backend.
//!
//! [`RegistryClient`] is what servers and discovery clients hold. It fixes the
//! data center, validates input before it reaches the backend, bounds every
//! call with a deadline and wraps each operation in a tracing span. It is a
//! [`ServerRegistry`] itself, so it can stand in wherever a backend is
//! expected.
//!
//! Retrying stays with the caller. [`RegistryClient::register_with_retry`] is
//! the loop a server runs on startup and after reconnecting.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use server_registry_sdk::{
    DEFAULT_DATA_CENTER, GetServersOptions, RegistryError, RegistryKind, RegistryScope,
    ServerDetail, ServerRegistry, SessionState,
};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::Instrument;

use crate::config::RegistryConfig;
use crate::factory::RegistryFactory;

fn duration_to_u64_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Backoff settings for [`RegistryClient::register_with_retry`].
///
/// The delay before retry `n` is `base_backoff * n`, capped at `max_backoff`.
#[derive(Debug, Clone)]
#[must_use]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_base_backoff(mut self, duration: Duration) -> Self {
        self.base_backoff = duration;
        self
    }

    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff.saturating_mul(attempt).min(self.max_backoff)
    }
}

/// Public registry surface used by shuffle servers and clients.
#[derive(Clone)]
pub struct RegistryClient {
    inner: Arc<dyn ServerRegistry>,
    data_center: String,
    timeout: Option<Duration>,
}

impl fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryClient")
            .field("kind", &self.inner.kind())
            .field("data_center", &self.data_center)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RegistryClient {
    /// Wrap a backend. Uses the default data center and no deadline.
    #[must_use]
    pub fn new(inner: Arc<dyn ServerRegistry>) -> Self {
        Self {
            inner,
            data_center: DEFAULT_DATA_CENTER.to_owned(),
            timeout: None,
        }
    }

    /// Build the configured backend and wrap it with the configured data
    /// center and operation timeout.
    ///
    /// # Errors
    ///
    /// Propagates [`RegistryFactory::create`] failures.
    pub async fn from_config(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let inner = RegistryFactory::create(config).await?;
        Ok(Self::new(inner)
            .with_data_center(config.data_center.clone())
            .with_timeout(config.operation_timeout))
    }

    #[must_use]
    pub fn with_data_center(mut self, data_center: impl Into<String>) -> Self {
        self.data_center = data_center.into();
        self
    }

    /// Deadline applied to every delegated call except `close`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn data_center(&self) -> &str {
        &self.data_center
    }

    /// Scope for `cluster` in this client's data center.
    #[must_use]
    pub fn scope(&self, cluster: impl Into<String>) -> RegistryScope {
        RegistryScope::new(self.data_center.clone(), cluster)
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn ServerRegistry> {
        &self.inner
    }

    async fn deadline<T, F>(
        &self,
        on_timeout: fn(String) -> RegistryError,
        call: F,
    ) -> Result<T, RegistryError>
    where
        F: Future<Output = Result<T, RegistryError>> + Send,
    {
        let Some(timeout) = self.timeout else {
            return call.await;
        };
        tokio::time::timeout(timeout, call).await.unwrap_or_else(|_| {
            Err(on_timeout(format!(
                "deadline of {} exceeded",
                humantime::format_duration(timeout)
            )))
        })
    }

    /// A closed backend answers `Closed` before any argument is looked at.
    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.inner.session_state() == SessionState::Closed {
            return Err(RegistryError::Closed);
        }
        Ok(())
    }

    /// Register, retrying retryable failures with capped linear backoff.
    ///
    /// After an `Unavailable` failure the backend is asked to reconnect
    /// before the next attempt if its session is not connected. Callers that
    /// register several servers through one coordinated backend must replay
    /// the others after a reconnect.
    ///
    /// # Errors
    ///
    /// Returns the last error once retries are exhausted, or the first
    /// non-retryable one.
    pub async fn register_with_retry(
        &self,
        scope: &RegistryScope,
        detail: &ServerDetail,
        policy: &RetryPolicy,
    ) -> Result<(), RegistryError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let err = match self.register_server(scope, detail).await {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(%scope, server_id = detail.server_id(), attempt, "registration succeeded after retries");
                    }
                    return Ok(());
                }
                Err(err) => err,
            };

            if !err.is_retryable() || attempt > policy.max_retries {
                tracing::error!(
                    %scope,
                    server_id = detail.server_id(),
                    attempt,
                    error = %err,
                    "registration giving up"
                );
                return Err(err);
            }

            let backoff = policy.backoff(attempt);
            tracing::debug!(
                %scope,
                server_id = detail.server_id(),
                attempt,
                error = %err,
                backoff_ms = duration_to_u64_ms(backoff),
                "retrying registration after backoff"
            );
            sleep(backoff).await;

            if err.is_unavailable() && !self.inner.session_state().is_connected() {
                match self.reconnect().await {
                    Ok(()) => {}
                    Err(RegistryError::Closed) => return Err(RegistryError::Closed),
                    Err(reconnect_err) => {
                        tracing::warn!(error = %reconnect_err, attempt, "reconnect before retry failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ServerRegistry for RegistryClient {
    fn kind(&self) -> RegistryKind {
        self.inner.kind()
    }

    async fn register_server(
        &self,
        scope: &RegistryScope,
        detail: &ServerDetail,
    ) -> Result<(), RegistryError> {
        self.ensure_open()?;
        scope.validate()?;
        detail.validate()?;
        let span = tracing::debug_span!(
            "registry.register_server",
            %scope,
            server_id = detail.server_id()
        );
        self.deadline(
            RegistryError::Registration,
            self.inner.register_server(scope, detail),
        )
        .instrument(span)
        .await
    }

    async fn get_servers(
        &self,
        scope: &RegistryScope,
        options: &GetServersOptions,
    ) -> Result<Vec<ServerDetail>, RegistryError> {
        self.ensure_open()?;
        scope.validate()?;
        let span = tracing::debug_span!(
            "registry.get_servers",
            %scope,
            max_count = ?options.max_count,
            excluded = options.exclude_hosts.len()
        );
        async {
            let servers = self
                .deadline(
                    RegistryError::Unavailable,
                    self.inner.get_servers(scope, options),
                )
                .await?;
            tracing::debug!(found = servers.len(), "servers listed");
            Ok(servers)
        }
        .instrument(span)
        .await
    }

    async fn lookup_servers(
        &self,
        scope: &RegistryScope,
        server_ids: &[String],
    ) -> Result<Vec<ServerDetail>, RegistryError> {
        self.ensure_open()?;
        scope.validate()?;
        let span = tracing::debug_span!(
            "registry.lookup_servers",
            %scope,
            requested = server_ids.len()
        );
        self.deadline(
            RegistryError::Unavailable,
            self.inner.lookup_servers(scope, server_ids),
        )
        .instrument(span)
        .await
    }

    fn session_state(&self) -> SessionState {
        self.inner.session_state()
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.subscribe()
    }

    async fn reconnect(&self) -> Result<(), RegistryError> {
        let span = tracing::info_span!("registry.reconnect", kind = %self.inner.kind());
        self.deadline(RegistryError::Unavailable, self.inner.reconnect())
            .instrument(span)
            .await
    }

    async fn close(&self) -> Result<(), RegistryError> {
        self.inner
            .close()
            .instrument(tracing::debug_span!("registry.close"))
            .await
    }
}
