use serde::{Deserialize, Serialize};

/// Carried by `REGISTER`. Field names match the wire format the original
/// spider-hole source speaks (`client_id`, `public_addr`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub client_id: String,
    pub name: String,
    pub public_addr: String,
    pub private_addr: String,
}

/// Carried by both `PUNCH`/`PUNCH_READY` and `CONNECT`. `private_addr`
/// may be empty or equal to `public_addr`, in which case the receiver
/// does not retry it as a separate dial candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PunchPayload {
    pub public_addr: String,
    #[serde(default)]
    pub private_addr: String,
}

impl PunchPayload {
    /// Dial candidates in order: `public_addr` first, then
    /// `private_addr` only if non-empty and distinct from it.
    pub fn candidates(&self) -> Vec<&str> {
        let mut out = vec![self.public_addr.as_str()];
        if !self.private_addr.is_empty() && self.private_addr != self.public_addr {
            out.push(self.private_addr.as_str());
        }
        out
    }
}

/// Carried by `HEARTBEAT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub client_id: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub p2p_bytes_sent: u64,
    pub p2p_bytes_recv: u64,
    pub peers: Vec<String>,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_addr_skipped_when_empty() {
        let p = PunchPayload {
            public_addr: "1.1.1.1:1".into(),
            private_addr: String::new(),
        };
        assert_eq!(p.candidates(), vec!["1.1.1.1:1"]);
    }

    #[test]
    fn private_addr_skipped_when_equal() {
        let p = PunchPayload {
            public_addr: "1.1.1.1:1".into(),
            private_addr: "1.1.1.1:1".into(),
        };
        assert_eq!(p.candidates(), vec!["1.1.1.1:1"]);
    }

    #[test]
    fn private_addr_included_when_distinct() {
        let p = PunchPayload {
            public_addr: "1.1.1.1:1".into(),
            private_addr: "192.168.0.2:1".into(),
        };
        assert_eq!(p.candidates(), vec!["1.1.1.1:1", "192.168.0.2:1"]);
    }
}
