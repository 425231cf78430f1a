//! Boundary to the coordination service backing [`crate::CoordinatedRegistry`].
//!
//! The registry needs four things from the service: a hierarchical namespace,
//! linearizable reads of small values, ephemeral nodes removed when their
//! session ends, and a way to observe session liveness. [`CoordinationSession`]
//! captures exactly that, so the registry can run against a real service
//! ([`EtcdConnector`]) or an in-process one ([`LocalEnsemble`]).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use server_registry_sdk::SessionState;
use thiserror::Error;
use tokio::sync::watch;

pub mod codec;
pub mod etcd;
pub mod local;

pub use codec::NodeValue;
pub use etcd::{EtcdConfig, EtcdConnector, EtcdSession};
pub use local::{LocalConnector, LocalEnsemble, LocalSession};

/// Failures reported by a coordination session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// The service could not be reached. The session may still be valid.
    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    /// The service dropped the session and its ephemeral nodes.
    #[error("session expired")]
    SessionExpired,

    /// The session was closed by its owner.
    #[error("session closed")]
    SessionClosed,

    /// The service rejected the request.
    #[error("backend error: {0}")]
    Backend(String),

    /// The service answered with something we could not understand.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A child node read together with its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildNode {
    pub name: String,
    pub data: Vec<u8>,
}

/// One session with the coordination service.
///
/// Ephemeral nodes written through a session live exactly as long as the
/// session. Writes issued through a session are visible to later reads on the
/// same session.
#[async_trait]
pub trait CoordinationSession: Send + Sync + fmt::Debug {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    fn state(&self) -> SessionState;

    fn subscribe(&self) -> watch::Receiver<SessionState>;

    /// Create or overwrite an ephemeral node. Ownership of an existing node at
    /// `path` moves to this session.
    async fn put_ephemeral(&self, path: &str, value: &[u8]) -> Result<(), CoordinationError>;

    /// Names of the direct children of `path`. A missing `path` has no
    /// children.
    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    /// Value stored at `path`, or `None` when there is no node.
    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinationError>;

    /// Children of `path` with their values.
    ///
    /// A child deleted between listing and reading is left out.
    async fn read_children(&self, path: &str) -> Result<Vec<ChildNode>, CoordinationError> {
        let names = self.list_children(path).await?;
        let mut children = Vec::with_capacity(names.len());
        for name in names {
            if let Some(data) = self.get_data(&join_path(path, &name)).await? {
                children.push(ChildNode { name, data });
            }
        }
        Ok(children)
    }

    /// End the session. Every ephemeral node it owns is removed. Idempotent.
    async fn close(&self) -> Result<(), CoordinationError>;
}

/// Opens sessions against one coordination service.
#[async_trait]
pub trait CoordinationConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn CoordinationSession>, CoordinationError>;
}

/// Join a parent path and a child name with a single `/`.
#[must_use]
pub fn join_path(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child.trim_start_matches('/'))
}

/// Normalize a namespace root to `/a/b` form.
///
/// # Errors
///
/// Returns a message when the root is empty or contains empty segments.
pub fn normalize_root(root: &str) -> Result<String, String> {
    let trimmed = root.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err("namespace root must not be empty".to_owned());
    }
    if trimmed.split('/').any(str::is_empty) {
        return Err(format!("namespace root has an empty segment: {root}"));
    }
    Ok(format!("/{trimmed}"))
}

/// Direct child name of `key` under `parent`, if `key` is one.
pub(crate) fn direct_child<'a>(parent: &str, key: &'a str) -> Option<&'a str> {
    let prefix = format!("{}/", parent.trim_end_matches('/'));
    let rest = key.strip_prefix(prefix.as_str())?;
    (!rest.is_empty() && !rest.contains('/')).then_some(rest)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/root/dc", "c1"), "/root/dc/c1");
        assert_eq!(join_path("/root/dc/", "/c1"), "/root/dc/c1");
    }

    #[test]
    fn test_normalize_root() {
        assert_eq!(normalize_root("server-registry").unwrap(), "/server-registry");
        assert_eq!(normalize_root("/a/b/").unwrap(), "/a/b");
        assert!(normalize_root("/").is_err());
        assert!(normalize_root("a//b").is_err());
    }

    #[test]
    fn test_direct_child() {
        assert_eq!(direct_child("/r/dc/c1", "/r/dc/c1/w1"), Some("w1"));
        assert_eq!(direct_child("/r/dc/c1", "/r/dc/c1/w1/x"), None);
        assert_eq!(direct_child("/r/dc/c1", "/r/dc/c10/w1"), None);
        assert_eq!(direct_child("/r/dc/c1", "/r/dc/c1/"), None);
    }

    /// Session whose listing reports a child that is gone by the time it is read.
    #[derive(Debug)]
    struct RacingSession {
        listed: Vec<String>,
        nodes: BTreeMap<String, Vec<u8>>,
        state: watch::Sender<SessionState>,
    }

    #[async_trait]
    impl CoordinationSession for RacingSession {
        fn id(&self) -> &str {
            "racing"
        }

        fn state(&self) -> SessionState {
            *self.state.borrow()
        }

        fn subscribe(&self) -> watch::Receiver<SessionState> {
            self.state.subscribe()
        }

        async fn put_ephemeral(&self, _path: &str, _value: &[u8]) -> Result<(), CoordinationError> {
            Err(CoordinationError::Backend("read-only".to_owned()))
        }

        async fn list_children(&self, _path: &str) -> Result<Vec<String>, CoordinationError> {
            Ok(self.listed.clone())
        }

        async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
            Ok(self.nodes.get(path).cloned())
        }

        async fn close(&self) -> Result<(), CoordinationError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_read_children_skips_nodes_deleted_after_listing() {
        let mut nodes = BTreeMap::new();
        nodes.insert("/r/dc/c1/w1".to_owned(), b"one".to_vec());
        let session = RacingSession {
            listed: vec!["w1".to_owned(), "w2".to_owned()],
            nodes,
            state: watch::Sender::new(SessionState::Connected),
        };

        let children = session.read_children("/r/dc/c1").await.unwrap();

        assert_eq!(
            children,
            vec![ChildNode {
                name: "w1".to_owned(),
                data: b"one".to_vec(),
            }]
        );
    }
}
