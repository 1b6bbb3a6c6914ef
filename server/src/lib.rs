//! Spider-hole rendezvous server: maintains the session registry,
//! forwards signaling messages between registered agents, and sweeps
//! away silent connections.

pub mod config;
pub mod forwarder;
pub mod liveness;
pub mod registry;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use registry::Registry;
pub use server::Server;
pub use session::{Session, SessionStatus, SessionView, StatusUpdate};
