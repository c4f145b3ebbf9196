use thiserror::Error;

pub const TAG_CONNECT: u8 = 0x01;
pub const TAG_PRESENT_BYTE: u8 = 0x02;
pub const TAG_PUSH_BYTE: u8 = 0x03;

pub const TAG_DID_CONNECT: u8 = 0x10;
pub const TAG_PULL_BYTE: u8 = 0x11;
pub const TAG_BYTE_PUSHED: u8 = 0x12;
pub const TAG_PULL_BYTE_STALE: u8 = 0x13;
pub const TAG_COMMIT_STALE_BYTE: u8 = 0x14;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("unknown command tag 0x{0:02X}")]
    UnknownTag(u8),
    #[error("command 0x{tag:02X} expects {expected} payload byte(s), got {actual}")]
    Length {
        tag: u8,
        expected: usize,
        actual: usize,
    },
}

/// Client to relay. Each frame is a command tag followed by one serial byte,
/// except `Connect`, which carries the ASCII room key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Authenticates this socket against a room.
    Connect(Vec<u8>),
    PresentByte(u8),
    PushByte(u8),
}

/// Relay to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundMessage {
    /// The relay accepted the room key.
    DidConnect,
    PullByte(u8),
    BytePushed(u8),
    PullByteStale(u8),
    CommitStaleByte(u8),
}

fn payload_byte(tag: u8, payload: &[u8]) -> Result<u8, ProtocolError> {
    match payload {
        [byte] => Ok(*byte),
        _ => Err(ProtocolError::Length {
            tag,
            expected: 1,
            actual: payload.len(),
        }),
    }
}

fn split_tag(frame: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    frame
        .split_first()
        .map(|(tag, payload)| (*tag, payload))
        .ok_or(ProtocolError::Empty)
}

impl OutboundMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Connect(key) => {
                let mut frame = Vec::with_capacity(key.len() + 1);
                frame.push(TAG_CONNECT);
                frame.extend_from_slice(key);
                frame
            }
            Self::PresentByte(byte) => vec![TAG_PRESENT_BYTE, *byte],
            Self::PushByte(byte) => vec![TAG_PUSH_BYTE, *byte],
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (tag, payload) = split_tag(frame)?;
        match tag {
            TAG_CONNECT => Ok(Self::Connect(payload.to_vec())),
            TAG_PRESENT_BYTE => Ok(Self::PresentByte(payload_byte(tag, payload)?)),
            TAG_PUSH_BYTE => Ok(Self::PushByte(payload_byte(tag, payload)?)),
            _ => Err(ProtocolError::UnknownTag(tag)),
        }
    }
}

impl InboundMessage {
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Self::DidConnect => vec![TAG_DID_CONNECT],
            Self::PullByte(byte) => vec![TAG_PULL_BYTE, byte],
            Self::BytePushed(byte) => vec![TAG_BYTE_PUSHED, byte],
            Self::PullByteStale(byte) => vec![TAG_PULL_BYTE_STALE, byte],
            Self::CommitStaleByte(byte) => vec![TAG_COMMIT_STALE_BYTE, byte],
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (tag, payload) = split_tag(frame)?;
        match tag {
            TAG_DID_CONNECT => {
                if payload.is_empty() {
                    Ok(Self::DidConnect)
                } else {
                    Err(ProtocolError::Length {
                        tag,
                        expected: 0,
                        actual: payload.len(),
                    })
                }
            }
            TAG_PULL_BYTE => Ok(Self::PullByte(payload_byte(tag, payload)?)),
            TAG_BYTE_PUSHED => Ok(Self::BytePushed(payload_byte(tag, payload)?)),
            TAG_PULL_BYTE_STALE => Ok(Self::PullByteStale(payload_byte(tag, payload)?)),
            TAG_COMMIT_STALE_BYTE => Ok(Self::CommitStaleByte(payload_byte(tag, payload)?)),
            _ => Err(ProtocolError::UnknownTag(tag)),
        }
    }
}
