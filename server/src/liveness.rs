use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::registry::Registry;

/// Spawn the periodic liveness sweep. Returns a sender; dropping or
/// sending on it stops the loop on its next tick — grounded in how the
/// teacher tears down long-lived tasks via an owned handle rather than a
/// `tokio_util::CancellationToken` dependency it doesn't otherwise carry.
pub fn spawn(registry: Arc<Registry>, period: Duration, timeout: chrono::Duration) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    registry.sweep_timeouts(timeout);
                }
                _ = shutdown_rx.changed() => {
                    tracing::debug!("liveness sweep shutting down");
                    break;
                }
            }
        }
    });
    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionStatus};
    use chrono::Utc;

    fn dummy_session(client_id: &str) -> Session {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let task = tokio::spawn(async { std::future::pending::<()>().await });
        let abort = task.abort_handle();
        Session {
            client_id: client_id.to_string(),
            name: client_id.to_string(),
            conn_id: 1,
            control_tx: tx,
            reader_abort: abort.clone(),
            writer_abort: abort,
            observed_addr: "127.0.0.1:1".into(),
            advertised_public_addr: "127.0.0.1:1".into(),
            advertised_private_addr: String::new(),
            status: SessionStatus::new_connected(Utc::now() - chrono::Duration::seconds(60)),
        }
    }

    #[tokio::test]
    async fn sweep_loop_marks_stale_session_disconnected() {
        let registry = Arc::new(Registry::new());
        registry.add(dummy_session("a1"));

        let shutdown = spawn(registry.clone(), Duration::from_millis(10), chrono::Duration::seconds(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown.send(true);

        assert!(!registry.snapshot()["a1"].connected);
    }
}
