use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use spider_protocol::{Envelope, FrameCodec, MessageType, ProtocolError, PunchPayload, RegisterPayload, SERVER_ID};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::AgentConfig;
use crate::heartbeat;
use crate::peer;
use crate::shared::Shared;

/// A running peer-agent: one control channel to the rendezvous server
/// (reconnectable), one local listener for inbound peer links, and
/// however many peer links are currently active.
pub struct Agent {
    shared: Arc<Shared>,
    config: AgentConfig,
    heartbeat_abort: Mutex<Option<AbortHandle>>,
    listener_task_abort: AbortHandle,
}

impl Agent {
    /// Bind the peer listener, spawn its accept loop, and block until
    /// the first successful registration with the server. Matches the
    /// connect procedure in order: listener first (so the agent has an
    /// address to advertise), then the reconnect-with-backoff dial.
    pub async fn connect(config: AgentConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let listener_addr = listener.local_addr()?.to_string();
        tracing::info!(%listener_addr, client_id = %config.client_id, "peer listener bound");

        let shared = Arc::new(Shared::new(config.client_id.clone(), config.name.clone(), listener_addr));

        let accept_shared = shared.clone();
        let max_frame = config.max_frame_bytes;
        let listener_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        tracing::debug!(%peer_addr, "accepted inbound peer connection");
                        let shared = accept_shared.clone();
                        tokio::spawn(async move {
                            peer::accept_and_establish(stream, shared, max_frame).await;
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "peer listener accept failed"),
                }
            }
        });
        let listener_task_abort = listener_task.abort_handle();

        let agent = Self {
            shared,
            config,
            heartbeat_abort: Mutex::new(None),
            listener_task_abort,
        };
        agent.establish_control_channel().await?;
        Ok(agent)
    }

    /// Re-dial the server and re-register, with exponential backoff on
    /// each failed attempt (1s default, capped at 30s, reset on
    /// success). Never returns `Err` — it blocks until it succeeds,
    /// matching the connect procedure's "blocking until first success".
    /// Exposed publicly so the embedding binary can call it again after
    /// the server-read loop reports the control channel dropped; per
    /// design, the agent does not restart this loop on its own.
    pub async fn establish_control_channel(&self) -> anyhow::Result<()> {
        let mut delay = Duration::from_millis(self.config.reconnect_initial_ms);
        let max_delay = Duration::from_millis(self.config.reconnect_max_ms);
        loop {
            match self.try_establish_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, delay_ms = delay.as_millis() as u64, "failed to reach server, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }
    }

    async fn try_establish_once(&self) -> anyhow::Result<()> {
        let stream = TcpStream::connect(&self.config.server_addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut codec = FrameCodec::with_max_frame(BufReader::new(read_half), self.config.max_frame_bytes);

        let register = RegisterPayload {
            client_id: self.shared.client_id.clone(),
            name: self.shared.name.clone(),
            public_addr: self.shared.listener_addr.clone(),
            private_addr: self.shared.listener_addr.clone(),
        };
        let env = Envelope::with_payload(MessageType::Register, self.shared.client_id.clone(), SERVER_ID, &register)?;
        let register_bytes = env.encode()?;
        write_half.write_all(&register_bytes).await?;
        self.shared.counters.lock().bytes_sent += register_bytes.len() as u64;

        let ack_frame = codec
            .next_frame()
            .await?
            .ok_or_else(|| anyhow::anyhow!("server closed connection before acking registration"))?;
        self.shared.counters.lock().bytes_recv += ack_frame.len() as u64;
        let ack: Envelope = serde_json::from_slice(&ack_frame)?;
        if ack.kind != MessageType::Register {
            anyhow::bail!("expected register ack, got {:?}", ack.kind);
        }

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
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
        let writer_abort = writer_task.abort_handle();
        *self.shared.control_tx.lock() = Some(tx);

        if let Some(prev) = self.heartbeat_abort.lock().take() {
            prev.abort();
        }
        let hb_abort = heartbeat::spawn(self.shared.clone(), Duration::from_secs(self.config.heartbeat_period_secs));
        *self.heartbeat_abort.lock() = Some(hb_abort);

        let shared = self.shared.clone();
        let dial_timeout = Duration::from_secs(self.config.dial_timeout_secs);
        let max_frame = self.config.max_frame_bytes;
        tokio::spawn(async move {
            run_server_read_loop(&shared, codec, dial_timeout, max_frame).await;
            writer_abort.abort();
            *shared.control_tx.lock() = None;
            tracing::warn!(client_id = %shared.client_id, "control channel dropped, reconnection is the caller's responsibility");
        });

        tracing::info!(client_id = %self.shared.client_id, "registered with server");
        Ok(())
    }

    /// `PUNCH{from=self,to=peer_id,payload=self's addresses}`. A no-op
    /// (logged) if already linked to `peer_id`.
    pub async fn connect_to_peer(&self, peer_id: &str) -> anyhow::Result<()> {
        if self.shared.peers.lock().contains_key(peer_id) {
            tracing::info!(peer_id, "already connected, ignoring connect_to_peer");
            return Ok(());
        }
        let tx = self
            .shared
            .control_tx
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("not connected to server"))?;
        let payload = PunchPayload {
            public_addr: self.shared.listener_addr.clone(),
            private_addr: self.shared.listener_addr.clone(),
        };
        let env = Envelope::with_payload(MessageType::Punch, self.shared.client_id.clone(), peer_id.to_string(), &payload)?;
        let bytes = env.encode()?;
        let len = bytes.len() as u64;
        tx.send(bytes)
            .await
            .map_err(|_| anyhow::anyhow!("control channel closed"))?;
        self.shared.counters.lock().bytes_sent += len;
        Ok(())
    }

    pub async fn send_message(&self, peer_id: &str, text: &str) -> anyhow::Result<()> {
        peer::send_message(&self.shared, peer_id, text).await
    }

    pub fn list_peers(&self) -> Vec<String> {
        self.shared.list_peers()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.control_tx.lock().is_some()
    }

    /// Cancel the heartbeat, drop the control channel, close the
    /// listener, then close every peer link — in that order, matching
    /// the cancellation ordering for agent shutdown.
    pub fn close(&self) {
        if let Some(hb) = self.heartbeat_abort.lock().take() {
            hb.abort();
        }
        *self.shared.control_tx.lock() = None;
        self.listener_task_abort.abort();
        for peer_id in self.shared.list_peers() {
            self.shared.drop_peer(&peer_id);
        }
    }
}

async fn run_server_read_loop(
    shared: &Arc<Shared>,
    mut codec: FrameCodec<BufReader<OwnedReadHalf>>,
    dial_timeout: Duration,
    max_frame: usize,
) {
    loop {
        let frame = match codec.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(ProtocolError::Io(e)) => {
                tracing::warn!(error = %e, "io error on server control channel");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed server frame");
                continue;
            }
        };
        shared.counters.lock().bytes_recv += frame.len() as u64;
        let envelope: Envelope = match serde_json::from_slice(&frame) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed server frame");
                continue;
            }
        };

        match envelope.kind {
            MessageType::Punch | MessageType::PunchReady => {
                dispatch_punch(shared, &envelope, dial_timeout, max_frame, true);
            }
            MessageType::Connect => {
                dispatch_punch(shared, &envelope, dial_timeout, max_frame, false);
            }
            MessageType::Register => {
                tracing::debug!("ignoring unsolicited register ack");
            }
            other => tracing::warn!(kind = ?other, "unexpected frame type on control channel"),
        }
    }
}

/// Shared handling for an incoming `PUNCH`/`PUNCH_READY` (send a
/// `CONNECT` acknowledgment once linked) or `CONNECT` (symmetric
/// fallback, no further acknowledgment) from the server.
fn dispatch_punch(shared: &Arc<Shared>, envelope: &Envelope, dial_timeout: Duration, max_frame: usize, ack_with_connect: bool) {
    let payload: PunchPayload = match envelope.decode_payload() {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "malformed punch/connect payload");
            return;
        }
    };
    let peer_id = envelope.from.clone();
    let candidates: Vec<String> = payload.candidates().into_iter().map(String::from).collect();
    let shared = shared.clone();
    tokio::spawn(async move {
        match peer::dial_and_establish(&shared, &peer_id, candidates, dial_timeout, max_frame).await {
            Ok(true) if ack_with_connect => send_connect_ack(&shared, &peer_id).await,
            Ok(_) => {}
            Err(e) => tracing::error!(peer_id = %peer_id, error = %e, "failed to establish peer link"),
        }
    });
}

async fn send_connect_ack(shared: &Arc<Shared>, peer_id: &str) {
    let Some(tx) = shared.control_tx.lock().clone() else {
        return;
    };
    let payload = PunchPayload {
        public_addr: shared.listener_addr.clone(),
        private_addr: shared.listener_addr.clone(),
    };
    let Ok(env) = Envelope::with_payload(MessageType::Connect, shared.client_id.clone(), peer_id.to_string(), &payload) else {
        return;
    };
    if let Ok(bytes) = env.encode() {
        let len = bytes.len() as u64;
        if tx.send(bytes).await.is_ok() {
            shared.counters.lock().bytes_sent += len;
        }
    }
}
