use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

/// Frame format version on the wire.
pub const FRAME_VERSION: u8 = 0;

/// Upper bound on a frame payload. Larger lengths are rejected before any
/// allocation happens.
pub const MAX_FRAME: u32 = 8 * 1024 * 1024;

/// `ver(1) | type(1) | stream(4) | seq(8) | len(4)`, big-endian.
pub const HEADER_LEN: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Hello = 0x01,
    Ping = 0x02,
    Pong = 0x03,
    ClipText = 0x10,
    FileOffer = 0x20,
    FileAccept = 0x21,
    FileReject = 0x22,
    FileChunk = 0x23,
    FileDone = 0x24,
}

impl MsgType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Hello),
            0x02 => Some(Self::Ping),
            0x03 => Some(Self::Pong),
            0x10 => Some(Self::ClipText),
            0x20 => Some(Self::FileOffer),
            0x21 => Some(Self::FileAccept),
            0x22 => Some(Self::FileReject),
            0x23 => Some(Self::FileChunk),
            0x24 => Some(Self::FileDone),
            _ => None,
        }
    }

    /// Logical stream a message type travels on: 1 control, 2 clipboard,
    /// 3 file transfer.
    pub fn stream(self) -> u32 {
        match self {
            Self::Hello | Self::Ping | Self::Pong => 1,
            Self::ClipText => 2,
            Self::FileOffer
            | Self::FileAccept
            | Self::FileReject
            | Self::FileChunk
            | Self::FileDone => 3,
        }
    }
}

/// One typed, sequenced, length-prefixed unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MsgType,
    pub stream: u32,
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MsgType, seq: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            stream: msg_type.stream(),
            seq,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(FRAME_VERSION);
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&self.stream.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decodes a buffer holding exactly one frame.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(NodeError::InvalidFrame("truncated header".into()));
        }
        if buf[0] != FRAME_VERSION {
            return Err(NodeError::InvalidFrame(format!(
                "unsupported version {}",
                buf[0]
            )));
        }
        let msg_type = MsgType::from_u8(buf[1])
            .ok_or_else(|| NodeError::InvalidFrame(format!("unknown type {:#04x}", buf[1])))?;
        let stream = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
        let seq = u64::from_be_bytes([
            buf[6], buf[7], buf[8], buf[9], buf[10], buf[11], buf[12], buf[13],
        ]);
        let len = u32::from_be_bytes([buf[14], buf[15], buf[16], buf[17]]);
        if len > MAX_FRAME {
            return Err(NodeError::InvalidFrame(format!(
                "payload length {len} exceeds cap"
            )));
        }
        if buf.len() != HEADER_LEN + len as usize {
            return Err(NodeError::InvalidFrame("truncated payload".into()));
        }
        Ok(Self {
            msg_type,
            stream,
            seq,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// HELLO payload: announced immediately after the handshake, exactly once
/// per direction. Unknown JSON fields are ignored for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub name: String,
    #[serde(default)]
    pub caps: Vec<String>,
}

impl HelloPayload {
    pub fn new(peer_id: String, name: String) -> Self {
        Self {
            peer_id,
            name,
            caps: vec!["text".to_string()],
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // serializing a struct of strings cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| NodeError::InvalidFrame(format!("bad hello payload: {e}")))
    }
}
