//! Coordination session over the etcd v3 JSON gateway.
//!
//! A session is a lease. Ephemeral nodes are keys attached to that lease, so
//! etcd deletes them when the lease is revoked or runs out. A background task
//! refreshes the lease every `session_ttl / 3` and publishes the resulting
//! [`SessionState`]:
//!
//! - transport failure, slow round or gateway stream error: `Disconnected`
//!   (the lease may still be alive)
//! - successful refresh: `Connected`
//! - lease reported gone: `Expired`, and the task stops
//!
//! Keys and values travel base64-encoded, and 64-bit integers as strings,
//! as the gateway expects.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};
use server_registry_sdk::SessionState;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{ChildNode, CoordinationConnector, CoordinationError, CoordinationSession, direct_child};

const LEASE_NOT_FOUND: &str = "requested lease not found";

/// Connection settings for an etcd cluster.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Gateway base URLs, e.g. `http://10.0.0.5:2379`. Tried in order.
    pub endpoints: Vec<String>,
    /// Lease TTL. The session expires this long after the last refresh.
    pub session_ttl: Duration,
    /// Upper bound on a single HTTP request.
    pub request_timeout: Duration,
}

/// Opens lease-backed sessions against an etcd cluster.
#[derive(Debug, Clone)]
pub struct EtcdConnector {
    gateway: Arc<Gateway>,
    session_ttl: Duration,
}

impl EtcdConnector {
    /// Build a connector. No request is issued until [`CoordinationConnector::connect`].
    ///
    /// # Errors
    ///
    /// Returns `Backend` when no endpoint is configured or the HTTP client
    /// cannot be built.
    pub fn new(config: EtcdConfig) -> Result<Self, CoordinationError> {
        if config.endpoints.is_empty() {
            return Err(CoordinationError::Backend(
                "at least one etcd endpoint is required".to_owned(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| CoordinationError::Backend(format!("http client: {e}")))?;

        Ok(Self {
            gateway: Arc::new(Gateway {
                client,
                endpoints: config
                    .endpoints
                    .iter()
                    .map(|e| e.trim_end_matches('/').to_owned())
                    .collect(),
                preferred: AtomicUsize::new(0),
            }),
            session_ttl: config.session_ttl,
        })
    }
}

#[async_trait]
impl CoordinationConnector for EtcdConnector {
    async fn connect(&self) -> Result<Arc<dyn CoordinationSession>, CoordinationError> {
        let session = EtcdSession::open(Arc::clone(&self.gateway), self.session_ttl).await?;
        Ok(Arc::new(session))
    }
}

// --- wire types -------------------------------------------------------------

#[derive(Serialize)]
struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    ttl: i64,
}

#[derive(Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID", deserialize_with = "de_i64")]
    id: i64,
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
}

#[derive(Serialize)]
struct LeaseIdRequest {
    #[serde(rename = "ID")]
    id: String,
}

/// One line of the keepalive stream. Failures arrive with HTTP 200 and an
/// `error` member instead of `result`.
#[derive(Deserialize)]
struct KeepAliveEnvelope {
    #[serde(default)]
    result: Option<KeepAliveResult>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Deserialize)]
struct StreamError {
    #[serde(default)]
    grpc_code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct KeepAliveResult {
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
    lease: String,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize, Default)]
struct GatewayError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

fn de_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

// --- gateway ----------------------------------------------------------------

/// HTTP access to the gateway with endpoint failover.
#[derive(Debug)]
struct Gateway {
    client: reqwest::Client,
    endpoints: Vec<String>,
    /// Index of the endpoint that answered last.
    preferred: AtomicUsize,
}

impl Gateway {
    async fn call<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp, CoordinationError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let bytes = self.call_raw(path, body).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CoordinationError::Protocol(format!("{path}: {e}")))
    }

    async fn call_raw<Req>(&self, path: &str, body: &Req) -> Result<Vec<u8>, CoordinationError>
    where
        Req: Serialize + Sync,
    {
        let count = self.endpoints.len();
        let start = self.preferred.load(Ordering::Relaxed);
        let mut last_error = String::new();

        for offset in 0..count {
            let idx = (start + offset) % count;
            let url = format!("{}{path}", self.endpoints[idx]);
            match self.client.post(&url).json(body).send().await {
                Ok(resp) => {
                    self.preferred.store(idx, Ordering::Relaxed);
                    return read_response(path, resp).await;
                }
                Err(e) => {
                    tracing::debug!(endpoint = %self.endpoints[idx], path, error = %e, "etcd endpoint unreachable");
                    last_error = e.to_string();
                }
            }
        }

        Err(CoordinationError::ConnectionLoss(last_error))
    }

    async fn grant(&self, ttl: Duration) -> Result<i64, CoordinationError> {
        let ttl = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let resp: LeaseGrantResponse = self
            .call("/v3/lease/grant", &LeaseGrantRequest { ttl })
            .await?;
        if resp.ttl <= 0 {
            return Err(CoordinationError::Protocol(
                "lease granted without TTL".to_owned(),
            ));
        }
        Ok(resp.id)
    }

    /// Refresh a lease. `Ok(false)` means etcd no longer knows it.
    ///
    /// A stream error naming a missing lease is `SessionExpired`. Any other
    /// stream error is `ConnectionLoss`: the lease may well be alive.
    async fn keep_alive(&self, lease: i64) -> Result<bool, CoordinationError> {
        let bytes = self
            .call_raw("/v3/lease/keepalive", &LeaseIdRequest { id: lease.to_string() })
            .await?;
        // Streaming endpoint: one JSON envelope per line.
        let line = bytes
            .split(|b| *b == b'\n')
            .find(|l| !l.iter().all(u8::is_ascii_whitespace))
            .ok_or_else(|| CoordinationError::Protocol("empty keepalive response".to_owned()))?;
        let envelope: KeepAliveEnvelope = serde_json::from_slice(line)
            .map_err(|e| CoordinationError::Protocol(format!("keepalive: {e}")))?;
        if let Some(err) = envelope.error {
            if err.message.contains(LEASE_NOT_FOUND) {
                return Err(CoordinationError::SessionExpired);
            }
            return Err(CoordinationError::ConnectionLoss(format!(
                "keepalive: {} (code {})",
                err.message, err.grpc_code
            )));
        }
        envelope.result.map(|r| r.ttl > 0).ok_or_else(|| {
            CoordinationError::Protocol("keepalive response without result".to_owned())
        })
    }

    async fn revoke(&self, lease: i64) -> Result<(), CoordinationError> {
        match self
            .call::<_, IgnoredAny>("/v3/lease/revoke", &LeaseIdRequest { id: lease.to_string() })
            .await
        {
            Ok(_) | Err(CoordinationError::SessionExpired) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn range(&self, key: &str, prefix: bool) -> Result<Vec<(String, Vec<u8>)>, CoordinationError> {
        let request = RangeRequest {
            key: BASE64.encode(key),
            range_end: prefix.then(|| BASE64.encode(prefix_end(key.as_bytes()))),
        };
        let resp: RangeResponse = self.call("/v3/kv/range", &request).await?;
        resp.kvs
            .into_iter()
            .map(|kv| {
                let key = BASE64
                    .decode(kv.key)
                    .ok()
                    .and_then(|k| String::from_utf8(k).ok())
                    .ok_or_else(|| CoordinationError::Protocol("undecodable key".to_owned()))?;
                let value = BASE64
                    .decode(kv.value)
                    .map_err(|e| CoordinationError::Protocol(format!("value of {key}: {e}")))?;
                Ok((key, value))
            })
            .collect()
    }
}

async fn read_response(path: &str, resp: reqwest::Response) -> Result<Vec<u8>, CoordinationError> {
    let status = resp.status();
    let body = resp
        .bytes()
        .await
        .map_err(|e| CoordinationError::ConnectionLoss(format!("{path}: {e}")))?;
    if status.is_success() {
        return Ok(body.to_vec());
    }

    let err: GatewayError = serde_json::from_slice(&body).unwrap_or_default();
    let message = if err.message.is_empty() { err.error } else { err.message };
    if message.contains(LEASE_NOT_FOUND) {
        return Err(CoordinationError::SessionExpired);
    }
    if status.is_server_error() && message.is_empty() {
        return Err(CoordinationError::ConnectionLoss(format!("{path}: HTTP {status}")));
    }
    Err(CoordinationError::Backend(format!("{path}: HTTP {status}: {message}")))
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    // All 0xff: range to the end of the keyspace.
    vec![0]
}

// --- session ----------------------------------------------------------------

/// Lease-backed session on an etcd cluster.
#[derive(Debug)]
pub struct EtcdSession {
    gateway: Arc<Gateway>,
    lease: i64,
    label: String,
    state_tx: Arc<watch::Sender<SessionState>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl EtcdSession {
    async fn open(gateway: Arc<Gateway>, ttl: Duration) -> Result<Self, CoordinationError> {
        let lease = gateway.grant(ttl).await?;
        let label = format!("etcd-lease-{lease:x}");
        let state_tx = Arc::new(watch::Sender::new(SessionState::Connected));
        let cancel = CancellationToken::new();

        let interval = (ttl / 3).max(Duration::from_millis(100));
        tokio::spawn(keep_alive_loop(
            Arc::clone(&gateway),
            lease,
            interval,
            Arc::clone(&state_tx),
            cancel.clone(),
        ));

        tracing::info!(session_id = %label, ttl_secs = ttl.as_secs(), "etcd session opened");
        Ok(Self {
            gateway,
            lease,
            label,
            state_tx,
            closed: AtomicBool::new(false),
            cancel,
        })
    }

    fn ensure_usable(&self) -> Result<(), CoordinationError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoordinationError::SessionClosed);
        }
        if *self.state_tx.borrow() == SessionState::Expired {
            return Err(CoordinationError::SessionExpired);
        }
        Ok(())
    }

    /// Record what a failed request says about the session.
    fn observe<T>(&self, result: Result<T, CoordinationError>) -> Result<T, CoordinationError> {
        if matches!(result, Err(CoordinationError::SessionExpired)) {
            self.state_tx.send_replace(SessionState::Expired);
            self.cancel.cancel();
        }
        result
    }
}

async fn keep_alive_loop(
    gateway: Arc<Gateway>,
    lease: i64,
    interval: Duration,
    state_tx: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the lease was just granted.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // A round may try every endpoint; it must not outlast the next tick.
        let refreshed = tokio::time::timeout(interval, gateway.keep_alive(lease))
            .await
            .unwrap_or_else(|_| {
                Err(CoordinationError::ConnectionLoss(format!(
                    "keepalive took longer than {}ms",
                    interval.as_millis()
                )))
            });

        match refreshed {
            Ok(true) => {
                state_tx.send_if_modified(|state| {
                    if *state == SessionState::Disconnected {
                        tracing::info!(lease, "etcd session reconnected");
                        *state = SessionState::Connected;
                        true
                    } else {
                        false
                    }
                });
            }
            Ok(false) | Err(CoordinationError::SessionExpired) => {
                tracing::warn!(lease, "etcd lease expired");
                state_tx.send_replace(SessionState::Expired);
                break;
            }
            Err(e) => {
                state_tx.send_if_modified(|state| {
                    if *state == SessionState::Connected {
                        tracing::warn!(lease, error = %e, "etcd keepalive failed");
                        *state = SessionState::Disconnected;
                        true
                    } else {
                        false
                    }
                });
            }
        }
    }
}

#[async_trait]
impl CoordinationSession for EtcdSession {
    fn id(&self) -> &str {
        &self.label
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    async fn put_ephemeral(&self, path: &str, value: &[u8]) -> Result<(), CoordinationError> {
        self.ensure_usable()?;
        let request = PutRequest {
            key: BASE64.encode(path),
            value: BASE64.encode(value),
            lease: self.lease.to_string(),
        };
        let result = self.gateway.call::<_, IgnoredAny>("/v3/kv/put", &request).await;
        self.observe(result).map(|_| ())
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        Ok(self
            .read_children(path)
            .await?
            .into_iter()
            .map(|child| child.name)
            .collect())
    }

    async fn get_data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        self.ensure_usable()?;
        let result = self.gateway.range(path, false).await;
        let kvs = self.observe(result)?;
        Ok(kvs.into_iter().find(|(k, _)| k == path).map(|(_, v)| v))
    }

    async fn read_children(&self, path: &str) -> Result<Vec<ChildNode>, CoordinationError> {
        self.ensure_usable()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let result = self.gateway.range(&prefix, true).await;
        let kvs = self.observe(result)?;
        Ok(kvs
            .into_iter()
            .filter_map(|(key, data)| {
                direct_child(path, &key).map(|name| ChildNode {
                    name: name.to_owned(),
                    data,
                })
            })
            .collect())
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        let result = self.gateway.revoke(self.lease).await;
        self.state_tx.send_replace(SessionState::Closed);
        tracing::info!(session_id = %self.label, "etcd session closed");
        result
    }
}

impl Drop for EtcdSession {
    fn drop(&mut self) {
        // Without a revoke the lease runs out on its own after the TTL.
        self.cancel.cancel();
    }
}
