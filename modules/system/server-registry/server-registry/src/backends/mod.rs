//! Registry backends.
//!
//! Three interchangeable implementations of [`ServerRegistry`]:
//!
//! - [`InMemoryRegistry`] - process-local map, for tests and single-process runs
//! - [`StandaloneRegistry`] - one statically configured server
//! - [`CoordinatedRegistry`] - ephemeral nodes on a coordination service
//!
//! [`ServerRegistry`]: server_registry_sdk::ServerRegistry

use std::sync::atomic::{AtomicBool, Ordering};

use server_registry_sdk::{RegistryError, SessionState};
use tokio::sync::watch;

pub mod coordinated;
pub mod in_memory;
pub mod standalone;

pub use coordinated::CoordinatedRegistry;
pub use in_memory::InMemoryRegistry;
pub use standalone::StandaloneRegistry;

/// Open/closed bookkeeping for backends without a remote session.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    closed: AtomicBool,
    state: watch::Sender<SessionState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            state: watch::Sender::new(SessionState::Connected),
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed);
        }
        Ok(())
    }

    /// Returns `true` for the call that actually closed.
    pub(crate) fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.state.send_replace(SessionState::Closed);
        }
        first
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}
