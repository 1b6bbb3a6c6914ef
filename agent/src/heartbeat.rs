use std::sync::Arc;
use std::time::Duration;

use spider_protocol::{Envelope, HeartbeatPayload, MessageType, SERVER_ID};

use crate::shared::Shared;

/// Spawn the heartbeat producer. Cancelled by aborting the returned
/// handle (done by the connection manager on close/reconnect).
pub fn spawn(shared: Arc<Shared>, period: Duration) -> tokio::task::AbortHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            tick(&shared).await;
        }
    });
    task.abort_handle()
}

async fn tick(shared: &Arc<Shared>) {
    let tx = { shared.control_tx.lock().clone() };
    let Some(tx) = tx else {
        tracing::debug!("no control channel yet, skipping heartbeat tick");
        return;
    };

    let (counters, peers) = {
        let counters = *shared.counters.lock();
        let peers = shared.list_peers();
        (counters, peers)
    };

    let payload = HeartbeatPayload {
        client_id: shared.client_id.clone(),
        bytes_sent: counters.bytes_sent,
        bytes_recv: counters.bytes_recv,
        p2p_bytes_sent: counters.p2p_bytes_sent,
        p2p_bytes_recv: counters.p2p_bytes_recv,
        peers,
        timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
    };

    let envelope = match Envelope::with_payload(MessageType::Heartbeat, shared.client_id.clone(), SERVER_ID, &payload) {
        Ok(env) => env,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode heartbeat");
            return;
        }
    };
    let bytes = match envelope.encode() {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode heartbeat frame");
            return;
        }
    };
    let len = bytes.len() as u64;
    if tx.send(bytes).await.is_err() {
        tracing::error!("failed to send heartbeat: control channel closed");
        return;
    }
    shared.counters.lock().bytes_sent += len;
}
