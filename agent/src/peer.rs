use std::sync::Arc;
use std::time::Duration;

use spider_protocol::{Envelope, FrameCodec, HeartbeatPayload, MessageType};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::shared::{PeerHandle, Shared};

const WRITE_QUEUE_DEPTH: usize = 32;

/// Dial each candidate address in order with `timeout`, returning the
/// first successful connection.
async fn dial_first_reachable(candidates: &[String], timeout: Duration) -> Option<TcpStream> {
    for addr in candidates {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Some(stream),
            Ok(Err(e)) => tracing::debug!(%addr, error = %e, "dial candidate failed"),
            Err(_) => tracing::debug!(%addr, "dial candidate timed out"),
        }
    }
    None
}

/// Outbound half of the punch: dial `peer_id` at `candidates`, send the
/// greeting frame, and start the peer link. Returns `Ok(true)` if a new
/// link was established, `Ok(false)` if `peer_id` was already present
/// (no-op, matching the idempotence requirement that a duplicate punch
/// never creates a second link).
pub async fn dial_and_establish(
    shared: &Arc<Shared>,
    peer_id: &str,
    candidates: Vec<String>,
    dial_timeout: Duration,
    max_frame: usize,
) -> anyhow::Result<bool> {
    if shared.peers.lock().contains_key(peer_id) {
        tracing::debug!(peer_id, "already linked, skipping dial");
        return Ok(false);
    }

    let Some(mut stream) = dial_first_reachable(&candidates, dial_timeout).await else {
        anyhow::bail!("all dial candidates for {peer_id} failed");
    };

    let greeting = Envelope::new(MessageType::Message, shared.client_id.clone(), peer_id.to_string());
    let bytes = greeting.encode()?;
    stream.write_all(&bytes).await?;
    {
        let mut counters = shared.counters.lock();
        counters.p2p_bytes_sent += bytes.len() as u64;
    }

    if shared.peers.lock().contains_key(peer_id) {
        // Lost the race to an inbound connection from the same peer.
        tracing::debug!(peer_id, "peer linked concurrently, dropping outbound dial");
        return Ok(false);
    }

    spawn_link(shared.clone(), peer_id.to_string(), stream, max_frame);
    Ok(true)
}

/// Inbound half: the first frame on an accepted connection must be a
/// `MESSAGE` greeting naming the originator. A greeting for a peer
/// already present is a duplicate connection and is closed rather than
/// replacing the existing link.
pub async fn accept_and_establish(stream: TcpStream, shared: Arc<Shared>, max_frame: usize) {
    let (read_half, write_half) = stream.into_split();
    let mut codec = FrameCodec::with_max_frame(BufReader::new(read_half), max_frame);
    let envelope = match codec.next_envelope().await {
        Ok(Some(env)) => env,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(error = %e, "failed to read greeting frame");
            return;
        }
    };
    if envelope.kind != MessageType::Message {
        tracing::warn!(kind = ?envelope.kind, "first frame on inbound peer connection was not a greeting");
        return;
    }
    let peer_id = envelope.from.clone();

    if shared.peers.lock().contains_key(&peer_id) {
        tracing::debug!(peer_id, "duplicate greeting for already-linked peer, closing new socket");
        return;
    }

    run_link(shared, peer_id, codec, write_half).await;
}

fn spawn_link(shared: Arc<Shared>, peer_id: String, stream: TcpStream, max_frame: usize) {
    let (read_half, write_half) = stream.into_split();
    let codec = FrameCodec::with_max_frame(BufReader::new(read_half), max_frame);
    tokio::spawn(async move {
        run_link(shared, peer_id, codec, write_half).await;
    });
}

async fn run_link(
    shared: Arc<Shared>,
    peer_id: String,
    codec: FrameCodec<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    });
    let abort = writer_task.abort_handle();

    {
        let mut peers = shared.peers.lock();
        if peers.contains_key(&peer_id) {
            // Lost a last-moment race; let this link go.
            abort.abort();
            return;
        }
        peers.insert(peer_id.clone(), PeerHandle { tx, abort });
    }

    tracing::info!(peer_id = %peer_id, "peer link established");
    read_loop(&shared, &peer_id, codec).await;
    shared.drop_peer(&peer_id);
    tracing::info!(peer_id = %peer_id, "peer link closed");
}

async fn read_loop(
    shared: &Arc<Shared>,
    peer_id: &str,
    mut codec: FrameCodec<BufReader<tokio::net::tcp::OwnedReadHalf>>,
) {
    loop {
        let frame = match codec.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(peer_id, error = %e, "error reading peer frame");
                break;
            }
        };
        {
            let mut counters = shared.counters.lock();
            counters.p2p_bytes_recv += frame.len() as u64;
        }
        let envelope: Envelope = match serde_json::from_slice(&frame) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(peer_id, error = %e, "dropping malformed peer frame");
                continue;
            }
        };
        if envelope.from != peer_id {
            tracing::warn!(peer_id, claimed_from = %envelope.from, "peer identity mismatch, dropping frame");
            continue;
        }
        match envelope.kind {
            MessageType::Message => {
                let text = envelope
                    .payload
                    .as_ref()
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                tracing::info!(peer_id, message = %text, "received peer message");
            }
            MessageType::Heartbeat => {
                if let Ok(hb) = envelope.decode_payload::<HeartbeatPayload>() {
                    tracing::debug!(peer_id, ?hb, "peer heartbeat");
                }
            }
            other => tracing::warn!(peer_id, kind = ?other, "unexpected frame type on peer link"),
        }
    }
}

/// Encode `text` as a `MESSAGE` to `peer_id` and write it, or return an
/// error if no link to that peer exists.
pub async fn send_message(shared: &Arc<Shared>, peer_id: &str, text: &str) -> anyhow::Result<()> {
    let tx = {
        let peers = shared.peers.lock();
        peers
            .get(peer_id)
            .map(|h| h.tx.clone())
            .ok_or_else(|| anyhow::anyhow!("no peer link to {peer_id}"))?
    };
    let envelope = Envelope::with_payload(
        MessageType::Message,
        shared.client_id.clone(),
        peer_id.to_string(),
        &serde_json::Value::String(text.to_string()),
    )?;
    let bytes = envelope.encode()?;
    {
        let mut counters = shared.counters.lock();
        counters.p2p_bytes_sent += bytes.len() as u64;
    }
    tx.send(bytes)
        .await
        .map_err(|_| anyhow::anyhow!("peer link to {peer_id} closed"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_and_establish_is_noop_when_peer_already_linked() {
        let shared = Arc::new(Shared::new("a1".into(), "A".into(), "127.0.0.1:0".into()));
        let (tx, _rx) = mpsc::channel(1);
        let task = tokio::spawn(async { std::future::pending::<()>().await });
        shared.peers.lock().insert(
            "a2".into(),
            PeerHandle { tx, abort: task.abort_handle() },
        );

        let created = dial_and_establish(&shared, "a2", vec!["127.0.0.1:1".into()], Duration::from_millis(50), 1024)
            .await
            .unwrap();
        assert!(!created);
    }
}
