use clap::Parser;

/// Peer-agent configuration. Mirrors the layering of `spider-server`'s
/// config (CLI flags / `SPIDER_*` env, no file overlay needed here since
/// an agent's identity is normally supplied per-invocation).
#[derive(Debug, Clone, Parser)]
#[command(name = "spider-agent", version, about = "Spider-hole NAT rendezvous peer-agent")]
pub struct AgentConfig {
    /// Rendezvous server address to dial.
    #[arg(long, env = "SPIDER_SERVER_ADDR", default_value = "127.0.0.1:19730")]
    pub server_addr: String,

    /// This agent's identifier, advertised in `REGISTER`.
    #[arg(long, env = "SPIDER_CLIENT_ID")]
    pub client_id: String,

    /// Human-readable name, advertised alongside `client_id`.
    #[arg(long, env = "SPIDER_NAME", default_value = "")]
    pub name: String,

    /// Initial reconnect backoff, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub reconnect_initial_ms: u64,

    /// Reconnect backoff cap, in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    pub reconnect_max_ms: u64,

    /// Per-candidate dial timeout when punching to a peer, in seconds.
    #[arg(long, default_value_t = 5)]
    pub dial_timeout_secs: u64,

    /// Heartbeat period, in seconds.
    #[arg(long, default_value_t = 10)]
    pub heartbeat_period_secs: u64,

    /// Cap on a single accepted frame, in bytes.
    #[arg(long, default_value_t = spider_protocol::DEFAULT_MAX_FRAME)]
    pub max_frame_bytes: usize,
}
