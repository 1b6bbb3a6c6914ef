use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Cumulative byte counters, split into server-channel and peer-channel
/// traffic. Snapshotted under one lock acquisition by the heartbeat
/// producer.
#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub p2p_bytes_sent: u64,
    pub p2p_bytes_recv: u64,
}

/// One entry in the `peers` mapping: the channel to that peer's writer
/// task and a handle to abort its read loop on close/dedup.
pub struct PeerHandle {
    pub tx: mpsc::Sender<Vec<u8>>,
    pub abort: AbortHandle,
}

/// State shared across the server connection manager, the peer accept
/// loop, every peer read loop, and the heartbeat producer. Analogous to
/// the teacher's `SharedState`, scoped to a single agent instead of a
/// whole server.
pub struct Shared {
    pub client_id: String,
    pub name: String,
    pub listener_addr: String,
    pub counters: Mutex<Counters>,
    pub peers: Mutex<HashMap<String, PeerHandle>>,
    /// Sender for the current control channel to the server, or `None`
    /// while disconnected. The heartbeat producer skips its tick when
    /// this is absent rather than erroring.
    pub control_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl Shared {
    pub fn new(client_id: String, name: String, listener_addr: String) -> Self {
        Self {
            client_id,
            name,
            listener_addr,
            counters: Mutex::new(Counters::default()),
            peers: Mutex::new(HashMap::new()),
            control_tx: Mutex::new(None),
        }
    }

    pub fn list_peers(&self) -> Vec<String> {
        self.peers.lock().keys().cloned().collect()
    }

    /// Remove and close a peer entry, if present. Idempotent.
    pub fn drop_peer(&self, peer_id: &str) {
        if let Some(handle) = self.peers.lock().remove(peer_id) {
            handle.abort.abort();
        }
    }
}
