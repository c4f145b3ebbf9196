use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ROOM_CODE_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("room code must be {ROOM_CODE_LEN} letters or digits, got {0:?}")]
pub struct InvalidRoomCode(pub String);

/// Six-character alphanumeric code that pairs two sessions.
///
/// User-typed codes go through [`RoomCode::parse`], which is case-insensitive.
/// Codes issued by the relay are validated and kept exactly as sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    pub fn parse(input: &str) -> Result<Self, InvalidRoomCode> {
        Self::try_from(input.trim().to_ascii_uppercase())
            .map_err(|_| InvalidRoomCode(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomCode {
    type Error = InvalidRoomCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() == ROOM_CODE_LEN && value.bytes().all(|b| b.is_ascii_alphanumeric()) {
            Ok(Self(value))
        } else {
            Err(InvalidRoomCode(value))
        }
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credential presented to the relay's link port. The variant records which
/// side of the room this device is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomKey {
    Owner(String),
    Participant(String),
}

impl RoomKey {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Owner(key) | Self::Participant(key) => key,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.as_str().as_bytes()
    }

    pub fn is_owner(&self) -> bool {
        matches!(self, Self::Owner(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRoomInfo {
    pub room_code: RoomCode,
    pub room_key: RoomKey,
    pub link_port: u16,
}

/// Session operations, used for rejections and failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CheckForRooms,
    CreateRoom,
    JoinRoom,
    CloseRoom,
    ConnectToRoom,
    Disconnect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CheckForRooms => "check for rooms",
            Self::CreateRoom => "create room",
            Self::JoinRoom => "join room",
            Self::CloseRoom => "close room",
            Self::ConnectToRoom => "connect to room",
            Self::Disconnect => "disconnect",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NotVerified,
    Request,
    Transport,
    Status(u16),
    Decode,
    Rejected,
    Connect,
}

/// Why the session landed in [`RoomStatus::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFailure {
    pub operation: Operation,
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.message)
    }
}

/// What the session currently knows about its room.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RoomStatus {
    #[default]
    NotChecked,
    NoRooms,
    RoomAvailable(LinkRoomInfo),
    ConnectingToRoom(LinkRoomInfo),
    ConnectedToRoom(LinkRoomInfo),
    Error(LinkFailure),
    Disconnected,
}

impl RoomStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotChecked => "not checked",
            Self::NoRooms => "no rooms",
            Self::RoomAvailable(_) => "room available",
            Self::ConnectingToRoom(_) => "connecting to room",
            Self::ConnectedToRoom(_) => "connected to room",
            Self::Error(_) => "error",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn room(&self) -> Option<&LinkRoomInfo> {
        match self {
            Self::RoomAvailable(info)
            | Self::ConnectingToRoom(info)
            | Self::ConnectedToRoom(info) => Some(info),
            Self::NotChecked | Self::NoRooms | Self::Error(_) | Self::Disconnected => None,
        }
    }
}

impl fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoomAvailable(info)
            | Self::ConnectingToRoom(info)
            | Self::ConnectedToRoom(info) => {
                write!(f, "{} ({})", self.name(), info.room_code)
            }
            Self::Error(failure) => write!(f, "error: {failure}"),
            Self::NotChecked | Self::NoRooms | Self::Disconnected => f.write_str(self.name()),
        }
    }
}
