//! Backend-independent registry logic.

pub mod selection;

pub use selection::{dedupe_ids, select_servers};
