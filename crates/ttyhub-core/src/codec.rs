//! Length-prefixed framing for the local IPC socket.
//!
//! Wire format: `[1-byte type][4-byte big-endian length][payload]`

use crate::error::{HubError, HubResult};

/// Size of the frame header (type byte + u32 length).
pub const HEADER_LEN: usize = 5;

/// Upper bound on a single frame payload. Anything larger is a protocol
/// violation, not a legitimate message.
pub const MAX_PAYLOAD_LEN: usize = 4 * 1024 * 1024;

/// Frame type byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// UTF-8 text destined for the session's stdin.
    Stdin = 0x01,
    /// JSON control command (`{cmd: resize|kill|reset-size|update-title, ...}`).
    Control = 0x02,
    /// JSON status update (`{app, status, ...}`), cached and rebroadcast.
    StatusUpdate = 0x03,
    /// Empty keepalive, echoed by receivers.
    Heartbeat = 0x04,
    /// JSON error payload (`{code, message, details?}`).
    Error = 0x05,
    /// Reserved for future use.
    StdoutSubscribe = 0x10,
    /// Reserved for future use.
    Metrics = 0x11,
}

impl FrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(FrameType::Stdin),
            0x02 => Some(FrameType::Control),
            0x03 => Some(FrameType::StatusUpdate),
            0x04 => Some(FrameType::Heartbeat),
            0x05 => Some(FrameType::Error),
            0x10 => Some(FrameType::StdoutSubscribe),
            0x11 => Some(FrameType::Metrics),
            _ => None,
        }
    }
}

/// A decoded frame: raw type byte plus payload.
///
/// The type byte is kept raw so unknown types survive decoding; callers
/// classify via [`Frame::frame_type`] and decide whether to skip or fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub ty: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_byte(self.ty)
    }
}

/// Encode a single frame.
pub fn encode_frame(ty: FrameType, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(ty as u8);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Streaming frame decoder: accumulates bytes and yields complete frames.
///
/// Handles arbitrary fragmentation: a frame may arrive one byte at a time
/// or many frames may arrive in a single read.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return all complete frames.
    pub fn feed(&mut self, data: &[u8]) -> HubResult<Vec<Frame>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            if self.buffer.len() < HEADER_LEN {
                break;
            }
            let ty = self.buffer[0];
            let len = u32::from_be_bytes([
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
                self.buffer[4],
            ]) as usize;

            if len > MAX_PAYLOAD_LEN {
                return Err(HubError::Protocol(format!(
                    "frame payload of {len} bytes exceeds limit"
                )));
            }
            if self.buffer.len() < HEADER_LEN + len {
                break;
            }

            let payload = self.buffer[HEADER_LEN..HEADER_LEN + len].to_vec();
            frames.push(Frame { ty, payload });
            self.buffer.drain(..HEADER_LEN + len);
        }

        Ok(frames)
    }

    /// Reset internal buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
