use bytes::{Buf, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

/// Size of the frame header the runtime prepends to every log chunk:
/// one channel marker byte, three padding bytes, and a big-endian u32 length.
const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogChannel {
    Stdin,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    pub channel: LogChannel,
    pub payload: Bytes,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DemuxError {
    #[error("invalid stream channel marker {0:#04x}")]
    InvalidChannel(u8),
}

/// Incremental decoder for the runtime's multiplexed log framing. Chunks may
/// split frames at any byte boundary; partial frames are buffered until the
/// rest arrives. Frames are yielded in arrival order, so interleaving between
/// stdout and stderr is preserved while byte order within each channel stays
/// intact.
#[derive(Debug, Default)]
pub struct LogDemuxer {
    buf: BytesMut,
}

impl LogDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one transport chunk and drains every frame completed by it.
    /// A decode error poisons the stream position, so the caller must treat
    /// it as the end of this sub-stream; frames already returned are intact.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<LogFrame>, DemuxError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while self.buf.len() >= FRAME_HEADER_LEN {
            let channel = match self.buf[0] {
                0 => LogChannel::Stdin,
                1 => LogChannel::Stdout,
                2 => LogChannel::Stderr,
                other => return Err(DemuxError::InvalidChannel(other)),
            };
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if self.buf.len() < FRAME_HEADER_LEN + len {
                break;
            }
            self.buf.advance(FRAME_HEADER_LEN);
            let payload = self.buf.split_to(len).freeze();
            if !payload.is_empty() {
                frames.push(LogFrame { channel, payload });
            }
        }

        Ok(frames)
    }
}

/// Incremental decoder for the runtime's newline-delimited JSON feeds (stats
/// and events). One transport chunk may carry several snapshots, or a partial
/// one; partial lines are buffered across chunks, and a line that fails to
/// parse is dropped without disturbing its neighbours.
#[derive(Debug, Default)]
pub struct JsonLineDecoder {
    partial: Vec<u8>,
}

impl JsonLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T: DeserializeOwned>(&mut self, chunk: &[u8]) -> Vec<T> {
        let mut decoded = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                if let Some(value) = parse_line(&self.partial) {
                    decoded.push(value);
                }
                self.partial.clear();
            } else {
                self.partial.push(*byte);
            }
        }
        decoded
    }

    /// Drains a trailing unterminated line, for finite feeds.
    pub fn finish<T: DeserializeOwned>(&mut self) -> Option<T> {
        let value = parse_line(&self.partial);
        self.partial.clear();
        value
    }
}

fn parse_line<T: DeserializeOwned>(line: &[u8]) -> Option<T> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!("Dropping malformed JSON line: {}", err);
            None
        }
    }
}
