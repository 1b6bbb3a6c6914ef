use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;

use crate::session::{Session, SessionStatus, SessionView, StatusUpdate};

/// The single source of truth for "who is reachable": every registered
/// agent's control connection and status, keyed by `client_id`.
///
/// All mutating operations lock the whole map; this is cheap because the
/// map holds metadata only (no I/O happens while the lock is held — the
/// lock is never acquired across an `.await`).
pub struct Registry {
    sessions: Mutex<HashMap<String, Session>>,
    conn_seq: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            conn_seq: AtomicU64::new(1),
        }
    }

    /// Allocate a connection id for a newly accepted socket, used to
    /// detect whether a session entry has since been replaced by a
    /// reconnect before a liveness sweep or disconnect handler acts on it.
    pub fn next_conn_id(&self) -> u64 {
        self.conn_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert `session`, closing any existing entry for the same
    /// `client_id` first. Returns whether this was a reconnect (an entry
    /// already existed) purely for logging at the call site.
    pub fn add(&self, session: Session) -> bool {
        let mut sessions = self.sessions.lock();
        let reconnect = if let Some(old) = sessions.get(&session.client_id) {
            old.close();
            true
        } else {
            false
        };
        sessions.insert(session.client_id.clone(), session);
        reconnect
    }

    pub fn remove(&self, client_id: &str) {
        if let Some(session) = self.sessions.lock().remove(client_id) {
            session.close();
        }
    }

    /// Clone of the control sender and current connected flag, if the
    /// client is registered. Used by the forwarder to write a frame
    /// without holding the registry lock across the write.
    pub fn control_sender(
        &self,
        client_id: &str,
    ) -> Option<(tokio::sync::mpsc::Sender<Vec<u8>>, bool)> {
        self.sessions
            .lock()
            .get(client_id)
            .map(|s| (s.control_tx.clone(), s.status.connected))
    }

    pub fn snapshot(&self) -> HashMap<String, SessionView> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, s)| (id.clone(), SessionView::from(s)))
            .collect()
    }

    /// Overwrite connection/traffic fields, preserving `connected_at`,
    /// `last_error`, `last_error_time`, and filtering `peers` against
    /// current membership (removing entries that don't exist or that
    /// name the sender itself).
    pub fn update_status(&self, client_id: &str, update: StatusUpdate) {
        let mut sessions = self.sessions.lock();
        let known: Vec<String> = sessions.keys().cloned().collect();
        let Some(session) = sessions.get_mut(client_id) else {
            tracing::warn!(client_id, "heartbeat for unknown client, ignoring");
            return;
        };

        let now = Utc::now();
        let prev = session.status.clone();
        let dt_seconds = (now - prev.last_seen).num_milliseconds() as f64 / 1000.0;

        let (bytes_rate, p2p_bytes_rate) = if dt_seconds > 0.0 {
            let prev_total = prev.bytes_sent + prev.bytes_recv;
            let new_total = update.bytes_sent + update.bytes_recv;
            let bytes_rate = (new_total as f64 - prev_total as f64) / dt_seconds;

            let prev_p2p_total = prev.p2p_bytes_sent + prev.p2p_bytes_recv;
            let new_p2p_total = update.p2p_bytes_sent + update.p2p_bytes_recv;
            let p2p_rate = (new_p2p_total as f64 - prev_p2p_total as f64) / dt_seconds;
            (bytes_rate, p2p_rate)
        } else {
            (prev.bytes_rate, prev.p2p_bytes_rate)
        };

        let filtered_peers: Vec<String> = update
            .peers
            .into_iter()
            .filter(|p| p != client_id && known.contains(p))
            .collect();

        let now_nanos = now.timestamp_nanos_opt().unwrap_or_default();
        let latency_ms = (now_nanos - update.timestamp_nanos) / 1_000_000;

        session.status = SessionStatus {
            connected: true,
            last_seen: now,
            connected_at: prev.connected_at,
            last_error: prev.last_error,
            last_error_time: prev.last_error_time,
            punch_status: prev.punch_status,
            peers: filtered_peers,
            bytes_sent: update.bytes_sent,
            bytes_recv: update.bytes_recv,
            p2p_bytes_sent: update.p2p_bytes_sent,
            p2p_bytes_recv: update.p2p_bytes_recv,
            bytes_rate,
            p2p_bytes_rate,
            latency_ms,
        };
    }

    /// Record an error against a session without marking it disconnected.
    pub fn record_error(&self, client_id: &str, err: impl Into<String>) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(client_id) {
            session.status.last_error = Some(err.into());
            session.status.last_error_time = Some(Utc::now());
        }
    }

    /// A session's reader task observed EOF or a hard I/O error on its
    /// connection. Marks the session disconnected, clears its peer list,
    /// resets rate fields, and strips it from every other session's peer
    /// list. Retains the entry for observability. `conn_id` guards
    /// against acting on a session a concurrent reconnect already
    /// replaced.
    pub fn on_disconnect(&self, client_id: &str, conn_id: u64) {
        let mut sessions = self.sessions.lock();
        let still_current = matches!(sessions.get(client_id), Some(s) if s.conn_id == conn_id);
        if !still_current {
            return;
        }
        let now = Utc::now();
        if let Some(session) = sessions.get_mut(client_id) {
            session.status.connected = false;
            session.status.last_seen = now;
            session.status.peers.clear();
            session.status.bytes_rate = 0.0;
            session.status.p2p_bytes_rate = 0.0;
        }
        for (id, session) in sessions.iter_mut() {
            if id != client_id {
                session.status.peers.retain(|p| p != client_id);
            }
        }
    }

    /// Periodic liveness sweep: any connected session silent longer than
    /// `timeout` is marked disconnected. Independent of the read-error
    /// path — this is what catches silent half-open connections.
    pub fn sweep_timeouts(&self, timeout: chrono::Duration) {
        let mut sessions = self.sessions.lock();
        let now = Utc::now();
        let mut timed_out = Vec::new();
        for (id, session) in sessions.iter_mut() {
            if session.status.connected && now - session.status.last_seen > timeout {
                session.status.connected = false;
                session.status.last_seen = now;
                session.status.peers.clear();
                session.status.bytes_rate = 0.0;
                session.status.p2p_bytes_rate = 0.0;
                session.status.last_error = Some("Connection timed out".to_string());
                session.status.last_error_time = Some(now);
                timed_out.push(id.clone());
            }
        }
        for id in &timed_out {
            tracing::warn!(client_id = %id, "session timed out during liveness sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn dummy_session(client_id: &str, conn_id: u64) -> Session {
        let (tx, _rx) = mpsc::channel(8);
        let task = tokio::spawn(async { std::future::pending::<()>().await });
        let abort = task.abort_handle();
        Session {
            client_id: client_id.to_string(),
            name: client_id.to_string(),
            conn_id,
            control_tx: tx,
            reader_abort: abort.clone(),
            writer_abort: abort,
            observed_addr: "127.0.0.1:1".into(),
            advertised_public_addr: "127.0.0.1:1".into(),
            advertised_private_addr: String::new(),
            status: SessionStatus::new_connected(Utc::now()),
        }
    }

    #[tokio::test]
    async fn reregistration_closes_previous_and_keeps_single_entry() {
        let registry = Registry::new();
        let reconnect = registry.add(dummy_session("a1", 1));
        assert!(!reconnect);
        let reconnect = registry.add(dummy_session("a1", 2));
        assert!(reconnect);
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(registry.snapshot()["a1"].observed_addr, "127.0.0.1:1");
    }

    #[tokio::test]
    async fn heartbeat_filters_self_and_unknown_peers() {
        let registry = Registry::new();
        registry.add(dummy_session("a1", 1));
        registry.add(dummy_session("a2", 1));
        registry.update_status(
            "a1",
            StatusUpdate {
                peers: vec!["a1".into(), "a2".into(), "ghost".into()],
                bytes_sent: 100,
                bytes_recv: 50,
                p2p_bytes_sent: 0,
                p2p_bytes_recv: 0,
                timestamp_nanos: Utc::now().timestamp_nanos_opt().unwrap(),
            },
        );
        let snap = registry.snapshot();
        assert_eq!(snap["a1"].peers, vec!["a2".to_string()]);
        assert_eq!(snap["a1"].bytes_sent, 100);
    }

    #[tokio::test]
    async fn disconnect_cascades_into_other_sessions_peer_lists() {
        let registry = Registry::new();
        registry.add(dummy_session("a1", 1));
        registry.add(dummy_session("a2", 1));
        registry.update_status(
            "a2",
            StatusUpdate {
                peers: vec!["a1".into()],
                bytes_sent: 0,
                bytes_recv: 0,
                p2p_bytes_sent: 0,
                p2p_bytes_recv: 0,
                timestamp_nanos: Utc::now().timestamp_nanos_opt().unwrap(),
            },
        );
        assert_eq!(registry.snapshot()["a2"].peers, vec!["a1".to_string()]);

        registry.on_disconnect("a1", 1);
        let snap = registry.snapshot();
        assert!(!snap["a1"].connected);
        assert!(snap["a1"].peers.is_empty());
        assert!(snap["a2"].peers.is_empty());
    }

    #[tokio::test]
    async fn stale_conn_id_disconnect_is_ignored() {
        let registry = Registry::new();
        registry.add(dummy_session("a1", 1));
        registry.add(dummy_session("a1", 2)); // reconnect bumps conn_id
        registry.on_disconnect("a1", 1); // stale signal from the old connection
        assert!(registry.snapshot()["a1"].connected);
    }

    #[tokio::test]
    async fn sweep_marks_silent_session_disconnected() {
        let registry = Registry::new();
        registry.add(dummy_session("a1", 1));
        {
            let mut sessions = registry.sessions.lock();
            sessions.get_mut("a1").unwrap().status.last_seen =
                Utc::now() - chrono::Duration::seconds(60);
        }
        registry.sweep_timeouts(chrono::Duration::seconds(30));
        let snap = registry.snapshot();
        assert!(!snap["a1"].connected);
        assert_eq!(snap["a1"].last_error.as_deref(), Some("Connection timed out"));
        assert_eq!(snap["a1"].bytes_rate, 0.0);
    }
}
