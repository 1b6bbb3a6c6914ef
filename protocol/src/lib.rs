//! Wire message envelope and newline-delimited JSON framing shared by the
//! spider-hole rendezvous server and its peer-agents.

pub mod envelope;
pub mod error;
pub mod framing;
pub mod payload;

pub use envelope::{Envelope, MessageType, SERVER_ID};
pub use error::ProtocolError;
pub use framing::{FrameCodec, DEFAULT_MAX_FRAME};
pub use payload::{HeartbeatPayload, PunchPayload, RegisterPayload};
