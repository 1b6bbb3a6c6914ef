use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

/// Rendezvous server configuration. CLI flags (or their `SPIDER_*` env
/// equivalents, via clap's `env` feature) take precedence over an
/// optional `--config` TOML file, which in turn overrides the defaults
/// below — the same layering `freeq-server` uses for its own
/// `ServerConfig`.
#[derive(Debug, Clone, Parser)]
#[command(name = "spider-server", version, about = "Spider-hole NAT rendezvous server")]
pub struct ServerConfig {
    /// Optional TOML file supplying any of the fields below. CLI flags
    /// win over values loaded from this file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address the control-channel listener binds to.
    #[arg(long, env = "SPIDER_BIND_ADDR", default_value = "0.0.0.0:19730")]
    pub bind_addr: String,

    /// Overrides `bind_addr` when set, matching the source's
    /// "hole bind address preferred when present" precedence.
    #[arg(long, env = "SPIDER_HOLE_BIND_ADDR")]
    pub hole_bind_addr: Option<String>,

    /// Maximum number of simultaneously registered clients. Reserved for
    /// implementer tuning; not currently enforced.
    #[arg(long, env = "SPIDER_MAX_CONN", default_value_t = 0)]
    pub max_conn: u32,

    /// Liveness sweep timeout, in seconds. A connected session silent
    /// longer than this is marked disconnected.
    #[arg(long, env = "SPIDER_TIMEOUT_SECS", default_value_t = 30)]
    pub timeout_secs: u64,

    /// Liveness sweep period, in seconds.
    #[arg(long, env = "SPIDER_LIVENESS_PERIOD_SECS", default_value_t = 10)]
    pub liveness_period_secs: u64,

    /// Reserved, non-normative tuning knobs carried from the source
    /// configuration surface.
    #[arg(long, env = "SPIDER_ACCEPT_TIMEOUT_SECS", default_value_t = 5)]
    pub accept_timeout_secs: u64,
    #[arg(long, env = "SPIDER_READ_TIMEOUT_MS", default_value_t = 0)]
    pub read_timeout_ms: u64,
    #[arg(long, env = "SPIDER_WRITE_TIMEOUT_MS", default_value_t = 0)]
    pub write_timeout_ms: u64,
    #[arg(long, env = "SPIDER_READ_BUFFER_SIZE", default_value_t = 4096)]
    pub read_buffer_size: usize,
    #[arg(long, env = "SPIDER_WRITE_BUFFER_SIZE", default_value_t = 4096)]
    pub write_buffer_size: usize,

    /// Cap on a single accepted frame, in bytes.
    #[arg(long, env = "SPIDER_MAX_FRAME_BYTES", default_value_t = spider_protocol::DEFAULT_MAX_FRAME)]
    pub max_frame_bytes: usize,
}

/// The subset of [`ServerConfig`] that may come from a TOML file. Every
/// field is optional; anything absent falls through to the CLI default.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bind_addr: Option<String>,
    hole_bind_addr: Option<String>,
    max_conn: Option<u32>,
    timeout_secs: Option<u64>,
    liveness_period_secs: Option<u64>,
    accept_timeout_secs: Option<u64>,
    read_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    read_buffer_size: Option<usize>,
    write_buffer_size: Option<usize>,
    max_frame_bytes: Option<usize>,
}

impl ServerConfig {
    /// Parse CLI args/env, then overlay a `--config` file if given. CLI
    /// values that differ from their defaults always win; this is
    /// approximated by only filling a field from the file when the CLI
    /// left it at its built-in default.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::parse();
        if let Some(path) = &config.config {
            let text = std::fs::read_to_string(path)?;
            let file: FileConfig = toml::from_str(&text)?;
            config.apply_file_overlay(file);
        }
        Ok(config)
    }

    fn apply_file_overlay(&mut self, file: FileConfig) {
        if self.bind_addr == "0.0.0.0:19730" {
            if let Some(v) = file.bind_addr {
                self.bind_addr = v;
            }
        }
        if self.hole_bind_addr.is_none() {
            self.hole_bind_addr = file.hole_bind_addr;
        }
        if self.max_conn == 0 {
            if let Some(v) = file.max_conn {
                self.max_conn = v;
            }
        }
        if self.timeout_secs == 30 {
            if let Some(v) = file.timeout_secs {
                self.timeout_secs = v;
            }
        }
        if self.liveness_period_secs == 10 {
            if let Some(v) = file.liveness_period_secs {
                self.liveness_period_secs = v;
            }
        }
        if self.accept_timeout_secs == 5 {
            if let Some(v) = file.accept_timeout_secs {
                self.accept_timeout_secs = v;
            }
        }
        if self.read_timeout_ms == 0 {
            if let Some(v) = file.read_timeout_ms {
                self.read_timeout_ms = v;
            }
        }
        if self.write_timeout_ms == 0 {
            if let Some(v) = file.write_timeout_ms {
                self.write_timeout_ms = v;
            }
        }
        if self.read_buffer_size == 4096 {
            if let Some(v) = file.read_buffer_size {
                self.read_buffer_size = v;
            }
        }
        if self.write_buffer_size == 4096 {
            if let Some(v) = file.write_buffer_size {
                self.write_buffer_size = v;
            }
        }
        if self.max_frame_bytes == spider_protocol::DEFAULT_MAX_FRAME {
            if let Some(v) = file.max_frame_bytes {
                self.max_frame_bytes = v;
            }
        }
    }

    /// The address actually bound: `hole_bind_addr` when set, else
    /// `bind_addr`.
    pub fn effective_bind_addr(&self) -> &str {
        self.hole_bind_addr.as_deref().unwrap_or(&self.bind_addr)
    }

    /// Build a config with every default except `bind_addr`, for tests
    /// that need an OS-assigned port.
    #[doc(hidden)]
    pub fn for_test(bind_addr: &str) -> Self {
        let mut config = Self::parse_from(["spider-server"]);
        config.bind_addr = bind_addr.to_string();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hole_bind_addr_overrides_bind_addr_when_set() {
        let mut config = ServerConfig::parse_from(["spider-server"]);
        assert_eq!(config.effective_bind_addr(), "0.0.0.0:19730");
        config.hole_bind_addr = Some("127.0.0.1:9000".into());
        assert_eq!(config.effective_bind_addr(), "127.0.0.1:9000");
    }
}
