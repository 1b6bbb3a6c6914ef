use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Reserved `from`/`to` identifier for server-originated messages.
pub const SERVER_ID: &str = "server";

/// Wire tag for [`Envelope::kind`].
///
/// Serializes to the lower-case strings the original spider-hole server
/// speaks (`"register"`, `"punch"`, ...). `PunchReady` and `Punch` are
/// distinct tags on the wire, but both are accepted as synonyms for "a
/// peer wants to dial me" wherever punch forwards are ingested — see
/// the server's forwarder and the agent's server-read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Register,
    Punch,
    PunchReady,
    Connect,
    Heartbeat,
    Message,
}

impl MessageType {
    /// True for `Punch` and `PunchReady`, the two wire names that both
    /// mean "dial this peer" on ingest.
    pub fn is_punch_like(self) -> bool {
        matches!(self, MessageType::Punch | MessageType::PunchReady)
    }
}

/// The single message envelope exchanged on every channel, control and
/// peer alike. `payload` is opaque and interpreted per `kind` by the
/// typed accessors below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Envelope {
    pub fn new(kind: MessageType, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            kind,
            from: from.into(),
            to: to.into(),
            payload: None,
        }
    }

    /// Build an envelope carrying a typed payload, serialized to JSON.
    pub fn with_payload<T: Serialize>(
        kind: MessageType,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind,
            from: from.into(),
            to: to.into(),
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    /// Decode `payload` as the given type. A missing payload decodes as
    /// `T`'s default-via-null behavior, i.e. fails unless `T` accepts
    /// `null` (callers needing an empty payload should check
    /// [`Envelope::payload`] directly instead).
    pub fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        let value = self.payload.clone().unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(value)?)
    }

    /// Encode this envelope as a single newline-terminated JSON line,
    /// matching the wire format readers scan for.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}
