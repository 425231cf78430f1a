//! In-process coordination service.
//!
//! `LocalEnsemble` keeps the namespace in memory but gives sessions the same
//! lifecycle a networked ensemble does: ephemeral nodes vanish with their
//! session, a partition turns every session `Disconnected`, and expiry is
//! explicit. Tests drive those transitions directly instead of waiting on
//! real timeouts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use server_registry_sdk::SessionState;
use tokio::sync::watch;

use super::{CoordinationConnector, CoordinationError, CoordinationSession, direct_child};

type SessionId = u64;

#[derive(Debug)]
struct StoredNode {
    data: Vec<u8>,
    /// `None` for persistent nodes.
    owner: Option<SessionId>,
}

#[derive(Debug)]
struct EnsembleState {
    nodes: BTreeMap<String, StoredNode>,
    sessions: HashMap<SessionId, watch::Sender<SessionState>>,
    next_session_id: SessionId,
    available: bool,
    latency: Duration,
}

impl EnsembleState {
    fn check(&self, id: SessionId) -> Result<(), CoordinationError> {
        if !self.sessions.contains_key(&id) {
            return Err(CoordinationError::SessionExpired);
        }
        if !self.available {
            return Err(CoordinationError::ConnectionLoss(
                "ensemble unreachable".to_owned(),
            ));
        }
        Ok(())
    }

    fn drop_session(&mut self, id: SessionId, terminal: SessionState) -> bool {
        let Some(tx) = self.sessions.remove(&id) else {
            return false;
        };
        self.nodes.retain(|_, node| node.owner != Some(id));
        tx.send_replace(terminal);
        true
    }
}

/// Shared in-process coordination service. Cloning yields another handle to
/// the same namespace.
#[derive(Debug, Clone)]
pub struct LocalEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl Default for LocalEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEnsemble {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EnsembleState {
                nodes: BTreeMap::new(),
                sessions: HashMap::new(),
                next_session_id: 1,
                available: true,
                latency: Duration::ZERO,
            })),
        }
    }

    #[must_use]
    pub fn connector(&self) -> LocalConnector {
        LocalConnector {
            ensemble: self.clone(),
        }
    }

    /// Open a session.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLoss` while the ensemble is unavailable.
    pub fn open_session(&self) -> Result<LocalSession, CoordinationError> {
        let mut st = self.state.lock();
        if !st.available {
            return Err(CoordinationError::ConnectionLoss(
                "ensemble unreachable".to_owned(),
            ));
        }
        let id = st.next_session_id;
        st.next_session_id += 1;
        let (tx, rx) = watch::channel(SessionState::Connected);
        st.sessions.insert(id, tx);
        tracing::debug!(session_id = id, "local session opened");
        Ok(LocalSession {
            id,
            label: format!("local-{id}"),
            ensemble: self.clone(),
            state: rx,
            closed: AtomicBool::new(false),
        })
    }

    /// Expire a session as the service would after its timeout. Returns
    /// `false` if the session was already gone.
    pub fn expire_session(&self, session_id: &str) -> bool {
        let Some(id) = parse_label(session_id) else {
            return false;
        };
        let expired = self.state.lock().drop_session(id, SessionState::Expired);
        if expired {
            tracing::info!(session_id = id, "local session expired");
        }
        expired
    }

    /// Simulate a partition (`false`) or its healing (`true`).
    pub fn set_available(&self, available: bool) {
        let mut st = self.state.lock();
        st.available = available;
        let next = if available {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        };
        for tx in st.sessions.values() {
            tx.send_replace(next);
        }
    }

    /// Delay applied to every session operation before it touches state.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Write a node owned by no session.
    pub fn put_persistent(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.state.lock().nodes.insert(
            path.to_owned(),
            StoredNode {
                data: data.into(),
                owner: None,
            },
        );
    }

    #[must_use]
    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    fn latency(&self) -> Duration {
        self.state.lock().latency
    }
}

fn parse_label(label: &str) -> Option<SessionId> {
    label.strip_prefix("local-")?.parse().ok()
}

/// Connector handing out sessions on a [`LocalEnsemble`].
#[derive(Debug, Clone)]
pub struct LocalConnector {
    ensemble: LocalEnsemble,
}

#[async_trait]
impl CoordinationConnector for LocalConnector {
    async fn connect(&self) -> Result<Arc<dyn CoordinationSession>, CoordinationError> {
        let session = self.ensemble.open_session()?;
        Ok(Arc::new(session))
    }
}

/// Session on a [`LocalEnsemble`].
#[derive(Debug)]
pub struct LocalSession {
    id: SessionId,
    label: String,
    ensemble: LocalEnsemble,
    state: watch::Receiver<SessionState>,
    closed: AtomicBool,
}

impl LocalSession {
    async fn simulate_latency(&self) {
        let latency = self.ensemble.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn ensure_open(&self) -> Result<(), CoordinationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoordinationError::SessionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationSession for LocalSession {
    fn id(&self) -> &str {
        &self.label
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    async fn put_ephemeral(&self, path: &str, value: &[u8]) -> Result<(), CoordinationError> {
        self.simulate_latency().await;
        self.ensure_open()?;
        let mut st = self.ensemble.state.lock();
        st.check(self.id)?;
        st.nodes.insert(
            path.to_owned(),
            StoredNode {
                data: value.to_vec(),
                owner: Some(self.id),
            },
        );
        Ok(())
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        self.simulate_latency().await;
        self.ensure_open()?;
        let st = self.ensemble.state.lock();
        st.check(self.id)?;
        Ok(st
            .nodes
            .keys()
            .filter_map(|key| direct_child(path, key))
            .map(str::to_owned)
            .collect())
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        self.simulate_latency().await;
        self.ensure_open()?;
        let st = self.ensemble.state.lock();
        st.check(self.id)?;
        Ok(st.nodes.get(path).map(|node| node.data.clone()))
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self
            .ensemble
            .state
            .lock()
            .drop_session(self.id, SessionState::Closed)
        {
            tracing::debug!(session_id = self.id, "local session closed");
        }
        Ok(())
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.ensemble
                .state
                .lock()
                .drop_session(self.id, SessionState::Closed);
        }
    }
}
