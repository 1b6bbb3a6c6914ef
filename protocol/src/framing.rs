use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::envelope::Envelope;
use crate::error::ProtocolError;

/// Default cap on a single accepted frame, matching spec.
pub const DEFAULT_MAX_FRAME: usize = 10 * 1024 * 1024;

/// Reads newline-delimited JSON envelopes off any `AsyncBufRead`.
///
/// One codec wraps one connection's read half and is reused across every
/// frame on it, so the server's control-connection reader, the agent's
/// server-read loop, and the agent's per-peer read loop all go through
/// this single implementation of the newline-scan-with-cap logic instead
/// of three copies of it.
pub struct FrameCodec<R> {
    reader: R,
    max_frame: usize,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameCodec<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame(reader, DEFAULT_MAX_FRAME)
    }

    pub fn with_max_frame(reader: R, max_frame: usize) -> Self {
        Self {
            reader,
            max_frame,
            buf: Vec::new(),
        }
    }

    /// Reads the next envelope. `Ok(None)` signals clean EOF. A decode
    /// failure or oversized frame is returned as `Err` without poisoning
    /// the codec — the next call resumes reading from the following
    /// frame, so callers can log-and-continue per spec.
    pub async fn next_envelope(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        let Some(line) = self.next_line().await? else {
            return Ok(None);
        };
        let envelope = serde_json::from_slice(&line)?;
        Ok(Some(envelope))
    }

    /// Raw access to the next newline-delimited frame, payload included,
    /// without decoding it. Used by the peer read loop to count received
    /// bytes (including the trailing newline) before interpreting them.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.next_line().await
    }

    async fn next_line(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if self.buf.len() > self.max_frame {
            let actual = self.buf.len();
            return Err(ProtocolError::FrameTooLarge {
                limit: self.max_frame,
                actual,
            });
        }
        Ok(Some(std::mem::take(&mut self.buf)))
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageType;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_multiple_frames_in_order() {
        let data = b"{\"type\":\"register\",\"from\":\"a1\",\"to\":\"server\"}\n\
                     {\"type\":\"heartbeat\",\"from\":\"a1\",\"to\":\"server\"}\n"
            .to_vec();
        let mut codec = FrameCodec::new(BufReader::new(&data[..]));
        let first = codec.next_envelope().await.unwrap().unwrap();
        assert_eq!(first.kind, MessageType::Register);
        let second = codec.next_envelope().await.unwrap().unwrap();
        assert_eq!(second.kind, MessageType::Heartbeat);
        assert!(codec.next_envelope().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_json_is_recoverable() {
        let data = b"not json\n{\"type\":\"register\",\"from\":\"a1\",\"to\":\"server\"}\n".to_vec();
        let mut codec = FrameCodec::new(BufReader::new(&data[..]));
        assert!(codec.next_envelope().await.is_err());
        let next = codec.next_envelope().await.unwrap().unwrap();
        assert_eq!(next.kind, MessageType::Register);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut data = vec![b'x'; 32];
        data.push(b'\n');
        let mut codec = FrameCodec::with_max_frame(BufReader::new(&data[..]), 8);
        match codec.next_envelope().await {
            Err(ProtocolError::FrameTooLarge { limit, actual }) => {
                assert_eq!(limit, 8);
                assert_eq!(actual, 33);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }
}
