use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use spider_protocol::{Envelope, FrameCodec, MessageType, ProtocolError, RegisterPayload, SERVER_ID};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::registry::Registry;
use crate::session::{Session, SessionStatus, StatusUpdate};

/// How many outbound frames the writer task will buffer before a slow
/// agent starts exerting backpressure on forwards destined for it.
const WRITE_QUEUE_DEPTH: usize = 64;

/// A connection that hasn't sent `REGISTER` yet has no `client_id`; once
/// it does, every subsequent frame is dispatched as that client.
enum ConnState {
    AwaitRegister,
    Active { client_id: String },
}

/// Drive one accepted TCP connection end to end: read frames, dispatch
/// them per the signaling rules, and clean up the registry on exit.
///
/// Mirrors the teacher's per-connection task shape: a dedicated writer
/// task drains an mpsc queue and owns the write half, while this
/// function owns the read half and only ever talks to the writer
/// through the channel, so a forward from another connection's task
/// never contends with this connection's own reads.
pub async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, registry: Arc<Registry>, max_frame: usize) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
            // Drain any frames already queued before paying for a flush.
            while let Ok(more) = rx.try_recv() {
                if write_half.write_all(&more).await.is_err() {
                    return;
                }
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    });
    let writer_abort = writer_task.abort_handle();

    // The reader runs as its own task so a session can hold an
    // `AbortHandle` for it (needed to force-close a superseded
    // connection on re-registration); the handle only exists once the
    // task is spawned, so it's threaded back in over a oneshot.
    let (abort_tx, abort_rx) = tokio::sync::oneshot::channel();
    let registry_for_reader = registry.clone();
    let reader_task = tokio::spawn(async move {
        let reader_abort = abort_rx.await.expect("abort handle sent before reader runs");
        run_reader(read_half, peer_addr, registry_for_reader, tx, writer_abort, reader_abort, max_frame).await;
    });
    let _ = abort_tx.send(reader_task.abort_handle());

    let _ = reader_task.await;
    writer_task.abort();
}

async fn run_reader(
    read_half: tokio::net::tcp::OwnedReadHalf,
    peer_addr: SocketAddr,
    registry: Arc<Registry>,
    tx: mpsc::Sender<Vec<u8>>,
    writer_abort: tokio::task::AbortHandle,
    reader_abort: tokio::task::AbortHandle,
    max_frame: usize,
) {
    let mut codec = FrameCodec::with_max_frame(BufReader::new(read_half), max_frame);
    let mut state = ConnState::AwaitRegister;
    let mut conn_id: Option<u64> = None;

    loop {
        let envelope = match codec.next_envelope().await {
            Ok(Some(env)) => env,
            Ok(None) => break,
            Err(ProtocolError::Io(e)) => {
                tracing::warn!(%peer_addr, error = %e, "io error reading frame");
                break;
            }
            Err(e) => {
                tracing::warn!(%peer_addr, error = %e, "dropping malformed frame");
                continue;
            }
        };

        match &mut state {
            ConnState::AwaitRegister => {
                if envelope.kind != MessageType::Register {
                    tracing::warn!(%peer_addr, kind = ?envelope.kind, "frame before registration, ignoring");
                    continue;
                }
                let payload: RegisterPayload = match envelope.decode_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(%peer_addr, error = %e, "malformed register payload");
                        continue;
                    }
                };
                let id = registry.next_conn_id();
                conn_id = Some(id);
                let session = Session {
                    client_id: payload.client_id.clone(),
                    name: payload.name.clone(),
                    conn_id: id,
                    control_tx: tx.clone(),
                    reader_abort: reader_abort.clone(),
                    writer_abort: writer_abort.clone(),
                    observed_addr: peer_addr.to_string(),
                    advertised_public_addr: payload.public_addr.clone(),
                    advertised_private_addr: payload.private_addr.clone(),
                    status: SessionStatus::new_connected(Utc::now()),
                };
                let reconnect = registry.add(session);
                tracing::info!(client_id = %payload.client_id, %reconnect, "client registered");

                let ack = Envelope::new(MessageType::Register, SERVER_ID, payload.client_id.clone());
                if let Ok(bytes) = ack.encode() {
                    let _ = tx.send(bytes).await;
                }
                state = ConnState::Active { client_id: payload.client_id };
            }

            ConnState::Active { client_id } => {
                if envelope.from != *client_id {
                    tracing::warn!(client_id = %client_id, claimed_from = %envelope.from, "dropping frame with mismatched sender");
                    continue;
                }
                match envelope.kind {
                    MessageType::Register => {
                        tracing::warn!(client_id = %client_id, "ignoring re-register on an active connection");
                    }
                    MessageType::Punch | MessageType::PunchReady => {
                        forward_punch(&registry, &envelope).await;
                    }
                    MessageType::Connect => {
                        forward_verbatim(&registry, &envelope, MessageType::Connect).await;
                    }
                    MessageType::Heartbeat => {
                        apply_heartbeat(&registry, client_id, &envelope);
                    }
                    MessageType::Message => {
                        tracing::debug!(client_id = %client_id, "ignoring peer-level MESSAGE on control channel");
                    }
                }
            }
        }
    }

    if let (ConnState::Active { client_id }, Some(id)) = (&state, conn_id) {
        registry.on_disconnect(client_id, id);
        tracing::info!(client_id = %client_id, "client disconnected");
    }
}

/// Forward a PUNCH/PUNCH_READY to its target, rewritten to the
/// canonical `PUNCH_READY` wire type.
async fn forward_punch(registry: &Registry, envelope: &Envelope) {
    forward_verbatim(registry, envelope, MessageType::PunchReady).await;
}

/// Relay `envelope.payload` to `envelope.to`, addressed from
/// `envelope.from`, tagged with `kind`. Logs and drops if the target
/// isn't registered or isn't connected.
async fn forward_verbatim(registry: &Registry, envelope: &Envelope, kind: MessageType) {
    let Some((target_tx, connected)) = registry.control_sender(&envelope.to) else {
        tracing::warn!(to = %envelope.to, "forward target not registered, dropping");
        return;
    };
    if !connected {
        tracing::warn!(to = %envelope.to, "forward target not connected, dropping");
        return;
    }
    let out = Envelope {
        kind,
        from: envelope.from.clone(),
        to: envelope.to.clone(),
        payload: envelope.payload.clone(),
    };
    match out.encode() {
        Ok(bytes) => {
            if target_tx.send(bytes).await.is_err() {
                tracing::debug!(to = %envelope.to, "forward target's writer task gone");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to encode forwarded frame"),
    }
}

fn apply_heartbeat(registry: &Registry, client_id: &str, envelope: &Envelope) {
    let payload: spider_protocol::HeartbeatPayload = match envelope.decode_payload() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(client_id, error = %e, "malformed heartbeat payload");
            return;
        }
    };
    if payload.client_id != client_id {
        registry.record_error(client_id, "heartbeat client_id mismatch");
        return;
    }
    registry.update_status(
        client_id,
        StatusUpdate {
            peers: payload.peers,
            bytes_sent: payload.bytes_sent,
            bytes_recv: payload.bytes_recv,
            p2p_bytes_sent: payload.p2p_bytes_sent,
            p2p_bytes_recv: payload.p2p_bytes_recv,
            timestamp_nanos: payload.timestamp,
        },
    );
}
