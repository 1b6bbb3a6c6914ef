use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Server-side record for one registered agent. Owns the exclusive
/// control connection (by abort handle, not the socket itself — the
/// socket halves live in the connection's reader/writer tasks).
pub struct Session {
    pub client_id: String,
    pub name: String,
    /// Monotonic id for the TCP connection currently backing this
    /// session. Used to avoid a liveness sweep or disconnect handler
    /// clobbering an entry a concurrent reconnect has already replaced.
    pub conn_id: u64,
    /// Encoded (newline-terminated) frames to write to this agent.
    pub control_tx: mpsc::Sender<Vec<u8>>,
    pub reader_abort: AbortHandle,
    pub writer_abort: AbortHandle,
    /// Peer address of the TCP socket, observed by the server.
    pub observed_addr: String,
    /// Address the agent advertised in its `REGISTER` payload.
    pub advertised_public_addr: String,
    pub advertised_private_addr: String,
    pub status: SessionStatus,
}

impl Session {
    /// Tear down this session's connection. Idempotent: aborting an
    /// already-finished task is a no-op.
    pub fn close(&self) {
        self.reader_abort.abort();
        self.writer_abort.abort();
    }
}

#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub punch_status: String,
    pub peers: Vec<String>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub p2p_bytes_sent: u64,
    pub p2p_bytes_recv: u64,
    pub bytes_rate: f64,
    pub p2p_bytes_rate: f64,
    pub latency_ms: i64,
}

impl SessionStatus {
    pub fn new_connected(now: DateTime<Utc>) -> Self {
        Self {
            connected: true,
            last_seen: now,
            connected_at: now,
            last_error: None,
            last_error_time: None,
            punch_status: String::new(),
            peers: Vec::new(),
            bytes_sent: 0,
            bytes_recv: 0,
            p2p_bytes_sent: 0,
            p2p_bytes_recv: 0,
            bytes_rate: 0.0,
            p2p_bytes_rate: 0.0,
            latency_ms: 0,
        }
    }
}

/// Read-only view of a [`Session`], safe to hand to a dashboard or test
/// assertion without exposing the connection's abort handles or sender.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub client_id: String,
    pub name: String,
    pub observed_addr: String,
    pub advertised_public_addr: String,
    pub advertised_private_addr: String,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub punch_status: String,
    pub peers: Vec<String>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub p2p_bytes_sent: u64,
    pub p2p_bytes_recv: u64,
    pub bytes_rate: f64,
    pub p2p_bytes_rate: f64,
    pub latency_ms: i64,
}

impl From<&Session> for SessionView {
    fn from(s: &Session) -> Self {
        Self {
            client_id: s.client_id.clone(),
            name: s.name.clone(),
            observed_addr: s.observed_addr.clone(),
            advertised_public_addr: s.advertised_public_addr.clone(),
            advertised_private_addr: s.advertised_private_addr.clone(),
            connected: s.status.connected,
            last_seen: s.status.last_seen,
            connected_at: s.status.connected_at,
            last_error: s.status.last_error.clone(),
            last_error_time: s.status.last_error_time,
            punch_status: s.status.punch_status.clone(),
            peers: s.status.peers.clone(),
            bytes_sent: s.status.bytes_sent,
            bytes_recv: s.status.bytes_recv,
            p2p_bytes_sent: s.status.p2p_bytes_sent,
            p2p_bytes_recv: s.status.p2p_bytes_recv,
            bytes_rate: s.status.bytes_rate,
            p2p_bytes_rate: s.status.p2p_bytes_rate,
            latency_ms: s.status.latency_ms,
        }
    }
}

/// Fields carried by a `HEARTBEAT`, passed to [`crate::registry::Registry::update_status`].
pub struct StatusUpdate {
    pub peers: Vec<String>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub p2p_bytes_sent: u64,
    pub p2p_bytes_recv: u64,
    pub timestamp_nanos: i64,
}
