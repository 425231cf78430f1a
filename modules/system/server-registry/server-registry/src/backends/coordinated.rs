//! Registry backed by a coordination service.
//!
//! Every record is one ephemeral node at `<root>/<data_center>/<cluster>/<server_id>`
//! holding a [`NodeValue`]. The node lives exactly as long as the session that
//! wrote it, so a crashed or partitioned server drops out of discovery without
//! any heartbeat logic here.
//!
//! The registry owns one session at a time. Its state is forwarded to
//! [`ServerRegistry::subscribe`] receivers; when it goes `Expired` the caller
//! decides when to [`ServerRegistry::reconnect`] and replays
//! [`CoordinatedRegistry::owned_registrations`]. Nothing is retried or
//! re-registered implicitly.
//!
//! Consistency: read-after-write for the same session; other sessions' writes
//! become visible within one coordination-service round-trip.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use server_registry_sdk::{
    GetServersOptions, RegistryError, RegistryKind, RegistryScope, ServerDetail, ServerRegistry,
    SessionState,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::coordination::{
    CoordinationConnector, CoordinationError, CoordinationSession, NodeValue, join_path,
    normalize_root,
};
use crate::domain::{dedupe_ids, select_servers};

/// Which side of the contract a coordination call serves. Decides the error
/// reported when it fails.
#[derive(Debug, Clone, Copy)]
enum Op {
    Register,
    Read,
}

impl Op {
    fn failure(self, message: String) -> RegistryError {
        match self {
            Self::Register => RegistryError::Registration(message),
            Self::Read => RegistryError::Unavailable(message),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Read => "read",
        }
    }
}

/// Registry-level session state, fed by whichever session is current.
///
/// Each installed session gets a generation; updates from a replaced session's
/// forwarder are dropped. `Closed` is terminal and only set by the registry.
#[derive(Debug)]
struct StateRelay {
    state: watch::Sender<SessionState>,
    generation: AtomicU64,
}

impl StateRelay {
    fn new() -> Self {
        Self {
            state: watch::Sender::new(SessionState::Disconnected),
            generation: AtomicU64::new(0),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn publish(&self, generation: u64, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == SessionState::Closed
                || next == SessionState::Closed
                || *current == next
                || self.generation.load(Ordering::Acquire) != generation
            {
                return false;
            }
            *current = next;
            true
        });
    }

    fn close(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state.send_replace(SessionState::Closed);
    }
}

fn spawn_relay(
    relay: Arc<StateRelay>,
    generation: u64,
    mut session_state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let next = *session_state.borrow_and_update();
            relay.publish(generation, next);
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = session_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Production backend: ephemeral nodes on a coordination service.
pub struct CoordinatedRegistry {
    connector: Arc<dyn CoordinationConnector>,
    root: String,
    operation_timeout: Duration,
    session: RwLock<Option<Arc<dyn CoordinationSession>>>,
    relay: Arc<StateRelay>,
    relay_task: Mutex<Option<CancellationToken>>,
    /// Serializes session replacement against `close`.
    swap: tokio::sync::Mutex<()>,
    registrations: DashMap<(RegistryScope, String), ServerDetail>,
    closed: AtomicBool,
}

impl fmt::Debug for CoordinatedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatedRegistry")
            .field("root", &self.root)
            .field("operation_timeout", &self.operation_timeout)
            .field("session", &self.session_id())
            .field("state", &*self.relay.state.borrow())
            .field("registrations", &self.registrations.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CoordinatedRegistry {
    /// Open the first session and build the registry.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an unusable `root` or a zero timeout and
    /// `Unavailable` when no session can be opened within `operation_timeout`.
    pub async fn connect(
        connector: Arc<dyn CoordinationConnector>,
        root: &str,
        operation_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let root = normalize_root(root).map_err(RegistryError::Configuration)?;
        if operation_timeout.is_zero() {
            return Err(RegistryError::Configuration(
                "operation timeout must be greater than zero".to_owned(),
            ));
        }

        let registry = Self {
            connector,
            root,
            operation_timeout,
            session: RwLock::new(None),
            relay: Arc::new(StateRelay::new()),
            relay_task: Mutex::new(None),
            swap: tokio::sync::Mutex::new(()),
            registrations: DashMap::new(),
            closed: AtomicBool::new(false),
        };
        let session = registry.open_session().await?;
        registry.install(session);
        tracing::info!(
            root = %registry.root,
            session_id = ?registry.session_id(),
            "coordinated registry connected"
        );
        Ok(registry)
    }

    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Identifier of the current session, `None` once closed.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.id().to_owned())
    }

    /// Registrations issued through this instance, sorted by scope and id.
    ///
    /// Kept across session loss so the owning server can replay them after
    /// [`ServerRegistry::reconnect`].
    #[must_use]
    pub fn owned_registrations(&self) -> Vec<(RegistryScope, ServerDetail)> {
        let mut owned: Vec<_> = self
            .registrations
            .iter()
            .map(|entry| (entry.key().0.clone(), entry.value().clone()))
            .collect();
        owned.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.server_id().cmp(b.1.server_id()))
        });
        owned
    }

    fn scope_path(&self, scope: &RegistryScope) -> String {
        join_path(&join_path(&self.root, scope.data_center()), scope.cluster())
    }

    fn node_path(&self, scope: &RegistryScope, server_id: &str) -> String {
        join_path(&self.scope_path(scope), server_id)
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        Ok(())
    }

    /// Current session, if it can serve requests right now.
    fn live_session(&self) -> Result<Arc<dyn CoordinationSession>, RegistryError> {
        self.ensure_open()?;
        let session = self.session.read().clone().ok_or(RegistryError::Closed)?;
        match session.state() {
            SessionState::Connected => Ok(session),
            SessionState::Disconnected => Err(RegistryError::Unavailable(format!(
                "session {} is disconnected",
                session.id()
            ))),
            SessionState::Expired => Err(RegistryError::Unavailable(format!(
                "session {} expired, reconnect required",
                session.id()
            ))),
            SessionState::Closed => Err(self.session_closed()),
        }
    }

    /// A session closed under a live registry was replaced by `reconnect`.
    fn session_closed(&self) -> RegistryError {
        if self.closed.load(Ordering::Acquire) {
            RegistryError::Closed
        } else {
            RegistryError::Unavailable("session was replaced".to_owned())
        }
    }

    fn map_error(&self, op: Op, err: CoordinationError) -> RegistryError {
        match err {
            CoordinationError::SessionClosed => self.session_closed(),
            other => op.failure(other.to_string()),
        }
    }

    /// Run one coordination call under the operation timeout.
    async fn run<T, F>(&self, op: Op, call: F) -> Result<T, RegistryError>
    where
        F: Future<Output = Result<T, CoordinationError>> + Send,
    {
        match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.map_error(op, err)),
            Err(_) => Err(op.failure(format!(
                "{} timed out after {}",
                op.name(),
                humantime::format_duration(self.operation_timeout)
            ))),
        }
    }

    async fn open_session(&self) -> Result<Arc<dyn CoordinationSession>, RegistryError> {
        match tokio::time::timeout(self.operation_timeout, self.connector.connect()).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(err)) => Err(RegistryError::Unavailable(format!(
                "cannot open session: {err}"
            ))),
            Err(_) => Err(RegistryError::Unavailable(format!(
                "cannot open session: timed out after {}",
                humantime::format_duration(self.operation_timeout)
            ))),
        }
    }

    /// Make `session` current and start forwarding its state. Returns the
    /// session it replaced.
    fn install(
        &self,
        session: Arc<dyn CoordinationSession>,
    ) -> Option<Arc<dyn CoordinationSession>> {
        let generation = self.relay.next_generation();
        let cancel = CancellationToken::new();
        let initial = session.state();
        spawn_relay(
            Arc::clone(&self.relay),
            generation,
            session.subscribe(),
            cancel.clone(),
        );
        if let Some(previous) = self.relay_task.lock().replace(cancel) {
            previous.cancel();
        }
        let previous = self.session.write().replace(session);
        self.relay.publish(generation, initial);
        previous
    }

    async fn release(&self, session: Arc<dyn CoordinationSession>) {
        let session_id = session.id().to_owned();
        match tokio::time::timeout(self.operation_timeout, session.close()).await {
            Ok(Ok(())) => tracing::debug!(%session_id, "session released"),
            Ok(Err(err)) => {
                tracing::warn!(%session_id, error = %err, "failed to release session");
            }
            Err(_) => tracing::warn!(%session_id, "timed out releasing session"),
        }
    }
}

fn decode_node(scope_path: &str, server_id: &str, data: &[u8]) -> Option<ServerDetail> {
    match NodeValue::decode(data) {
        Ok(value) => Some(value.into_detail(server_id)),
        Err(error) => {
            tracing::warn!(
                path = %join_path(scope_path, server_id),
                server_id,
                %error,
                "skipping unreadable registration"
            );
            None
        }
    }
}

fn is_path_segment(id: &str) -> bool {
    !id.trim().is_empty() && !id.contains('/')
}

#[async_trait]
impl ServerRegistry for CoordinatedRegistry {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Coordinated
    }

    async fn register_server(
        &self,
        scope: &RegistryScope,
        detail: &ServerDetail,
    ) -> Result<(), RegistryError> {
        self.ensure_open()?;
        scope.validate()?;
        detail.validate()?;

        let session = self.live_session()?;
        let path = self.node_path(scope, detail.server_id());
        let value = NodeValue::from_detail(detail)
            .encode()
            .map_err(|e| RegistryError::Registration(format!("cannot encode {path}: {e}")))?;

        self.run(Op::Register, session.put_ephemeral(&path, &value))
            .await?;
        self.registrations.insert(
            (scope.clone(), detail.server_id().to_owned()),
            detail.clone(),
        );
        tracing::debug!(
            %scope,
            server_id = detail.server_id(),
            running_version = detail.running_version(),
            session_id = session.id(),
            %path,
            "server registered"
        );
        Ok(())
    }

    async fn get_servers(
        &self,
        scope: &RegistryScope,
        options: &GetServersOptions,
    ) -> Result<Vec<ServerDetail>, RegistryError> {
        self.ensure_open()?;
        scope.validate()?;

        let session = self.live_session()?;
        let path = self.scope_path(scope);
        let children = self.run(Op::Read, session.read_children(&path)).await?;
        let candidates = children
            .into_iter()
            .filter_map(|child| decode_node(&path, &child.name, &child.data))
            .collect();
        Ok(select_servers(candidates, options))
    }

    async fn lookup_servers(
        &self,
        scope: &RegistryScope,
        server_ids: &[String],
    ) -> Result<Vec<ServerDetail>, RegistryError> {
        self.ensure_open()?;
        scope.validate()?;

        let session = self.live_session()?;
        let scope_path = self.scope_path(scope);
        let reads = dedupe_ids(server_ids)
            .into_iter()
            .filter(|id| is_path_segment(id))
            .map(|id| {
                let session = Arc::clone(&session);
                let path = join_path(&scope_path, id);
                async move {
                    let data = session.get_data(&path).await?;
                    Ok::<_, CoordinationError>((id, data))
                }
            });
        let found = self
            .run(Op::Read, futures::future::try_join_all(reads))
            .await?;

        Ok(found
            .into_iter()
            .filter_map(|(id, data)| data.and_then(|data| decode_node(&scope_path, id, &data)))
            .collect())
    }

    fn session_state(&self) -> SessionState {
        *self.relay.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.relay.state.subscribe()
    }

    async fn reconnect(&self) -> Result<(), RegistryError> {
        let _swap = self.swap.lock().await;
        self.ensure_open()?;

        let session = self.open_session().await?;
        let session_id = session.id().to_owned();
        if let Some(previous) = self.install(session) {
            tracing::info!(
                previous = previous.id(),
                %session_id,
                "coordination session replaced"
            );
            self.release(previous).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), RegistryError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.relay.close();

        let _swap = self.swap.lock().await;
        if let Some(cancel) = self.relay_task.lock().take() {
            cancel.cancel();
        }
        let session = self.session.write().take();
        if let Some(session) = session {
            self.release(session).await;
        }
        tracing::info!(root = %self.root, "coordinated registry closed");
        Ok(())
    }
}

impl Drop for CoordinatedRegistry {
    fn drop(&mut self) {
        // A `close` cancelled midway may have left the session behind.
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.relay.close();
        }
        if let Some(cancel) = self.relay_task.get_mut().take() {
            cancel.cancel();
        }
        let Some(session) = self.session.get_mut().take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = session.close().await {
                    tracing::warn!(session_id = session.id(), error = %err, "failed to release session on drop");
                }
            });
        }
    }
}
