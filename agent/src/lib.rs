//! Spider-hole peer-agent: holds a reconnectable control channel to the
//! rendezvous server, advertises a local listener for inbound peer
//! links, dials outbound peer links on signal, and reports liveness via
//! periodic heartbeats.

pub mod client;
pub mod config;
pub mod heartbeat;
pub mod peer;
pub mod shared;

pub use client::Agent;
pub use config::AgentConfig;
