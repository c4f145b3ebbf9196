use log::debug;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ConfigError, RelayConfig};
use crate::identity::RegistrationStatus;
use crate::room::{FailureKind, LinkRoomInfo, RoomCode, RoomKey};

pub const CHECK_ROOMS_PATH: &str = "/api/getRoomInfo";
pub const CREATE_ROOM_PATH: &str = "/api/createRoom";
pub const JOIN_ROOM_PATH: &str = "/api/joinRoom";
pub const CLOSE_ROOM_PATH: &str = "/api/closeRoom";

#[derive(Debug, Error)]
pub enum MatchmakingError {
    #[error("device identity is not verified")]
    NotVerified,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("relay responded with status {0}")]
    Status(u16),
    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("relay rejected request: {0}")]
    Rejected(String),
    #[error("failed to start request: {0}")]
    Spawn(#[source] std::io::Error),
}

impl MatchmakingError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NotVerified => FailureKind::NotVerified,
            Self::Config(_) | Self::Encode(_) | Self::Spawn(_) => FailureKind::Request,
            Self::Http(_) => FailureKind::Transport,
            Self::Status(code) => FailureKind::Status(*code),
            Self::Decode(_) => FailureKind::Decode,
            Self::Rejected(_) => FailureKind::Rejected,
        }
    }
}

/// The device id, or [`MatchmakingError::NotVerified`] before the relay has
/// confirmed it.
pub fn require_verified(identity: &RegistrationStatus) -> Result<&str, MatchmakingError> {
    identity.verified_id().ok_or(MatchmakingError::NotVerified)
}

/// Result of asking the relay whether this device already belongs to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomCheck {
    NotInRoom,
    InRoom(LinkRoomInfo),
}

/// Room lifecycle calls against the relay. Implementations block; the session
/// runs them off the owning thread.
pub trait Matchmaker: Send + Sync {
    fn check_rooms(&self, device_id: &str) -> Result<RoomCheck, MatchmakingError>;
    fn create_room(&self, device_id: &str) -> Result<LinkRoomInfo, MatchmakingError>;
    fn join_room(&self, device_id: &str, code: &RoomCode)
    -> Result<LinkRoomInfo, MatchmakingError>;
    fn close_room(&self, device_id: &str) -> Result<(), MatchmakingError>;
}

#[derive(Serialize)]
struct DeviceRequest<'a> {
    #[serde(rename = "deviceID")]
    device_id: &'a str,
}

#[derive(Serialize)]
struct JoinRoomRequest<'a> {
    #[serde(rename = "deviceID")]
    device_id: &'a str,
    #[serde(rename = "roomCode")]
    room_code: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum TaggedRoomKey {
    Owner(String),
    Participant(String),
}

// Older relays send the key as a bare string and leave the role implied by
// the endpoint.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireRoomKey {
    Bare(String),
    Tagged(TaggedRoomKey),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomInfoPayload {
    room_code: RoomCode,
    room_key: WireRoomKey,
    link_port: u16,
}

impl RoomInfoPayload {
    fn into_info(self, bare_role: fn(String) -> RoomKey) -> LinkRoomInfo {
        let room_key = match self.room_key {
            WireRoomKey::Bare(key) => bare_role(key),
            WireRoomKey::Tagged(TaggedRoomKey::Owner(key)) => RoomKey::Owner(key),
            WireRoomKey::Tagged(TaggedRoomKey::Participant(key)) => RoomKey::Participant(key),
        };
        LinkRoomInfo {
            room_code: self.room_code,
            room_key,
            link_port: self.link_port,
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "status")]
enum RoomInfoResponse {
    #[serde(rename = "isNotInRoom")]
    NotInRoom,
    #[serde(rename = "isInRoom")]
    InRoom(RoomInfoPayload),
}

#[derive(Deserialize)]
struct GenericMessageResponse {
    status: String,
    #[serde(default)]
    message: String,
}

pub fn decode_room_check(body: &[u8]) -> Result<RoomCheck, MatchmakingError> {
    let response: RoomInfoResponse =
        serde_json::from_slice(body).map_err(MatchmakingError::Decode)?;
    Ok(match response {
        RoomInfoResponse::NotInRoom => RoomCheck::NotInRoom,
        RoomInfoResponse::InRoom(payload) => {
            RoomCheck::InRoom(payload.into_info(RoomKey::Participant))
        }
    })
}

pub fn decode_created_room(body: &[u8]) -> Result<LinkRoomInfo, MatchmakingError> {
    let payload: RoomInfoPayload = serde_json::from_slice(body).map_err(MatchmakingError::Decode)?;
    Ok(payload.into_info(RoomKey::Owner))
}

pub fn decode_joined_room(body: &[u8]) -> Result<LinkRoomInfo, MatchmakingError> {
    let payload: RoomInfoPayload = serde_json::from_slice(body).map_err(MatchmakingError::Decode)?;
    Ok(payload.into_info(RoomKey::Participant))
}

pub fn decode_generic_message(body: &[u8]) -> Result<String, MatchmakingError> {
    let response: GenericMessageResponse =
        serde_json::from_slice(body).map_err(MatchmakingError::Decode)?;
    match response.status.as_str() {
        "success" | "ok" => Ok(response.message),
        _ => Err(MatchmakingError::Rejected(response.message)),
    }
}

/// [`Matchmaker`] backed by the relay's HTTP API.
#[derive(Debug, Clone)]
pub struct RelayApiClient {
    config: RelayConfig,
    client: Client,
}

impl RelayApiClient {
    pub fn new(config: RelayConfig) -> Result<Self, MatchmakingError> {
        // One-shot client: no idle connections survive between calls.
        let client = Client::builder().pool_max_idle_per_host(0).build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Vec<u8>, MatchmakingError> {
        let url = self.config.api_url(path, query)?;
        self.submit(self.client.get(url))
    }

    fn post<T: Serialize>(&self, path: &str, payload: &T) -> Result<Vec<u8>, MatchmakingError> {
        let url = self.config.api_url(path, &[])?;
        let body = serde_json::to_vec(payload).map_err(MatchmakingError::Encode)?;
        let request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json; charset=UTF-8")
            .body(body);
        self.submit(request)
    }

    fn submit(&self, request: RequestBuilder) -> Result<Vec<u8>, MatchmakingError> {
        let response = request
            .header(CACHE_CONTROL, "no-cache")
            .header(PRAGMA, "no-cache")
            .send()?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(MatchmakingError::Status(status.as_u16()));
        }
        Ok(response.bytes()?.to_vec())
    }
}

impl Matchmaker for RelayApiClient {
    fn check_rooms(&self, device_id: &str) -> Result<RoomCheck, MatchmakingError> {
        let body = self.get(CHECK_ROOMS_PATH, &[("deviceID", device_id)])?;
        decode_room_check(&body)
    }

    fn create_room(&self, device_id: &str) -> Result<LinkRoomInfo, MatchmakingError> {
        let body = self.post(CREATE_ROOM_PATH, &DeviceRequest { device_id })?;
        decode_created_room(&body)
    }

    fn join_room(
        &self,
        device_id: &str,
        code: &RoomCode,
    ) -> Result<LinkRoomInfo, MatchmakingError> {
        let request = JoinRoomRequest {
            device_id,
            room_code: code.as_str(),
        };
        let body = self.post(JOIN_ROOM_PATH, &request)?;
        decode_joined_room(&body)
    }

    fn close_room(&self, device_id: &str) -> Result<(), MatchmakingError> {
        let body = self.post(CLOSE_ROOM_PATH, &DeviceRequest { device_id })?;
        let message = decode_generic_message(&body)?;
        debug!("Link: close room response: {message}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_not_in_room() {
        let check = decode_room_check(br#"{"status":"isNotInRoom"}"#).expect("decode");
        assert_eq!(check, RoomCheck::NotInRoom);
    }

    #[test]
    fn decodes_in_room_with_bare_key_as_participant() {
        let body = br#"{"status":"isInRoom","roomCode":"AB12CD","roomKey":"k1","linkPort":5000}"#;
        let RoomCheck::InRoom(info) = decode_room_check(body).expect("decode") else {
            panic!("expected a room");
        };
        assert_eq!(info.room_code.as_str(), "AB12CD");
        assert_eq!(info.room_key, RoomKey::Participant("k1".to_string()));
        assert_eq!(info.link_port, 5000);
    }

    #[test]
    fn decodes_tagged_owner_key() {
        let body = br#"{"status":"isInRoom","roomCode":"AB12CD","roomKey":{"owner":"k2"},"linkPort":5001}"#;
        let RoomCheck::InRoom(info) = decode_room_check(body).expect("decode") else {
            panic!("expected a room");
        };
        assert_eq!(info.room_key, RoomKey::Owner("k2".to_string()));
    }

    #[test]
    fn created_room_is_owned_and_joined_room_is_not() {
        let body = br#"{"roomCode":"AB12CD","roomKey":"ownerKey","linkPort":5000}"#;
        let created = decode_created_room(body).expect("decode");
        assert_eq!(created.room_key, RoomKey::Owner("ownerKey".to_string()));
        let joined = decode_joined_room(body).expect("decode");
        assert_eq!(joined.room_key, RoomKey::Participant("ownerKey".to_string()));
    }

    #[test]
    fn issued_room_code_case_is_preserved() {
        let body = br#"{"roomCode":"ab12cd","roomKey":"ownerKey","linkPort":5000}"#;
        let created = decode_created_room(body).expect("decode");
        assert_eq!(created.room_code.as_str(), "ab12cd");
    }

    #[test]
    fn rejects_malformed_room_payloads() {
        let bad_code = br#"{"roomCode":"AB1","roomKey":"k","linkPort":5000}"#;
        assert!(matches!(
            decode_created_room(bad_code),
            Err(MatchmakingError::Decode(_))
        ));
        let bad_port = br#"{"roomCode":"AB12CD","roomKey":"k","linkPort":70000}"#;
        assert!(matches!(
            decode_created_room(bad_port),
            Err(MatchmakingError::Decode(_))
        ));
        assert!(matches!(
            decode_room_check(br#"{"status":"somethingElse"}"#),
            Err(MatchmakingError::Decode(_))
        ));
    }

    #[test]
    fn generic_message_failure_is_a_rejection() {
        assert_eq!(
            decode_generic_message(br#"{"status":"success","message":"closed"}"#)
                .expect("decode"),
            "closed"
        );
        let err = decode_generic_message(br#"{"status":"failure","message":"no room"}"#)
            .expect_err("rejected");
        assert_eq!(err.kind(), FailureKind::Rejected);
    }

    #[test]
    fn unverified_identity_is_refused() {
        assert!(matches!(
            require_verified(&RegistrationStatus::Unverified("x".to_string())),
            Err(MatchmakingError::NotVerified)
        ));
        assert_eq!(
            require_verified(&RegistrationStatus::Verified("x".to_string())).expect("verified"),
            "x"
        );
    }
}
