//! Encoding of registration values stored in coordination-service nodes.
//!
//! A node value is a small JSON object:
//!
//! ```json
//! {"version":1,"runningVersion":"v2","hostAndPort":"10.0.0.2:9000"}
//! ```
//!
//! Unknown fields are ignored on decode so newer writers can add fields
//! without breaking older readers.

use serde::{Deserialize, Serialize};
use server_registry_sdk::ServerDetail;

/// Format version written by this crate.
pub const NODE_VALUE_VERSION: u32 = 1;

/// Decoded node value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeValue {
    #[serde(default = "default_version")]
    pub version: u32,
    pub running_version: String,
    pub host_and_port: String,
}

fn default_version() -> u32 {
    NODE_VALUE_VERSION
}

impl NodeValue {
    #[must_use]
    pub fn from_detail(detail: &ServerDetail) -> Self {
        Self {
            version: NODE_VALUE_VERSION,
            running_version: detail.running_version().to_owned(),
            host_and_port: detail.host_and_port().to_owned(),
        }
    }

    /// Serialize for storage.
    ///
    /// # Errors
    ///
    /// Returns the serializer error; plain string fields never trigger it in
    /// practice.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a stored value, rejecting values with empty required fields.
    ///
    /// # Errors
    ///
    /// Returns a description of why the value is unusable.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let value: Self = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        if value.running_version.trim().is_empty() {
            return Err("empty runningVersion".to_owned());
        }
        if value.host_and_port.trim().is_empty() {
            return Err("empty hostAndPort".to_owned());
        }
        Ok(value)
    }

    #[must_use]
    pub fn into_detail(self, server_id: &str) -> ServerDetail {
        ServerDetail::new(server_id, self.running_version, self.host_and_port)
    }
}
