//! Link cable sessions over a network relay.
//!
//! This crate pairs two emulator instances through the relay's room API and
//! then carries their serial bytes over a persistent link connection.
//! Frontends drive everything through the [`session::LinkSession`] facade.

/// Relay location and URL building.
pub mod config;

/// Device registration contract.
pub mod identity;

/// Room lifecycle requests against the relay's HTTP API.
pub mod matchmaking;

/// Binary frames exchanged over the link connection.
pub mod protocol;

/// Room codes, keys and session status.
pub mod room;

/// Serial byte contract with the emulation core.
pub mod serial;

/// Session state machine and serial byte relay.
pub mod session;

/// Link connections and their I/O threads.
pub mod transport;

pub use config::RelayConfig;
pub use identity::RegistrationStatus;
pub use matchmaking::{Matchmaker, MatchmakingError, RelayApiClient, RoomCheck};
pub use room::{FailureKind, LinkFailure, LinkRoomInfo, Operation, RoomCode, RoomKey, RoomStatus};
pub use serial::{SerialDestination, SerialEndpoint};
pub use session::{LinkSession, ObserverId, SessionError, SessionUpdate};
