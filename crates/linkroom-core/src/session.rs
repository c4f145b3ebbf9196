use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel as cb;
use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::config::RelayConfig;
use crate::identity::RegistrationStatus;
use crate::matchmaking::{Matchmaker, MatchmakingError, RelayApiClient, RoomCheck, require_verified};
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::room::{
    FailureKind, InvalidRoomCode, LinkFailure, LinkRoomInfo, Operation, RoomCode, RoomStatus,
};
use crate::serial::{NO_PEER_BYTE, SerialDestination, SerialEndpoint};
use crate::transport::{
    ConnectionId, LinkTransport, TransportConnector, TransportEvent, TransportEventSink,
    WebSocketConnector,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("another link operation is still in progress")]
    Busy,
    #[error("cannot {operation} while {status}")]
    NotAllowed {
        operation: Operation,
        status: &'static str,
    },
    #[error(transparent)]
    InvalidRoomCode(#[from] InvalidRoomCode),
}

/// Snapshot handed to observers after every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub status: RoomStatus,
    pub is_working: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

pub(crate) enum MatchmakingOutcome {
    Checked(Result<RoomCheck, MatchmakingError>),
    Room(Result<LinkRoomInfo, MatchmakingError>),
    Closed(Result<(), MatchmakingError>),
}

pub(crate) enum SessionEvent {
    Matchmaking {
        epoch: u64,
        operation: Operation,
        outcome: MatchmakingOutcome,
    },
    Transport {
        connection: ConnectionId,
        event: TransportEvent,
    },
}

struct Connection {
    id: ConnectionId,
    transport: Box<dyn LinkTransport>,
    close_requested: bool,
}

type Observer = Box<dyn FnMut(&SessionUpdate)>;

/// Room lifecycle and serial relay for one device.
///
/// Owned by one thread. Matchmaking requests run on worker threads and
/// transport I/O on the connection's own thread; both report back through a
/// channel drained only by [`LinkSession::poll_events`] or
/// [`LinkSession::wait_for_event`].
pub struct LinkSession {
    config: RelayConfig,
    matchmaker: Arc<dyn Matchmaker>,
    connector: Box<dyn TransportConnector>,
    endpoint: Box<dyn SerialEndpoint>,

    registration: RegistrationStatus,
    status: RoomStatus,
    is_working: bool,
    // Set by disconnect(): is_working stays up until the close arrives.
    release_on_close: bool,
    pending_byte: Option<u8>,
    epoch: u64,

    connection: Option<Connection>,
    next_connection: u64,

    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,

    events_tx: cb::Sender<SessionEvent>,
    events_rx: cb::Receiver<SessionEvent>,
}

impl LinkSession {
    pub fn new(
        config: RelayConfig,
        matchmaker: Arc<dyn Matchmaker>,
        connector: Box<dyn TransportConnector>,
        endpoint: Box<dyn SerialEndpoint>,
    ) -> Self {
        let (events_tx, events_rx) = cb::unbounded();
        Self {
            config,
            matchmaker,
            connector,
            endpoint,
            registration: RegistrationStatus::default(),
            status: RoomStatus::default(),
            is_working: false,
            release_on_close: false,
            pending_byte: None,
            epoch: 0,
            connection: None,
            next_connection: 0,
            observers: Vec::new(),
            next_observer: 0,
            events_tx,
            events_rx,
        }
    }

    /// Session talking to a real relay over HTTP and WebSocket.
    pub fn with_relay(
        config: RelayConfig,
        endpoint: Box<dyn SerialEndpoint>,
    ) -> Result<Self, MatchmakingError> {
        let client = RelayApiClient::new(config.clone())?;
        Ok(Self::new(
            config,
            Arc::new(client),
            Box::new(WebSocketConnector::default()),
            endpoint,
        ))
    }

    pub fn status(&self) -> &RoomStatus {
        &self.status
    }

    pub fn is_working(&self) -> bool {
        self.is_working
    }

    pub fn registration(&self) -> &RegistrationStatus {
        &self.registration
    }

    pub fn pending_presented_byte(&self) -> Option<u8> {
        self.pending_byte
    }

    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Bytes flow only while connected and not shutting down.
    pub fn is_link_established(&self) -> bool {
        matches!(self.status, RoomStatus::ConnectedToRoom(_))
            && self
                .connection
                .as_ref()
                .is_some_and(|connection| !connection.close_requested)
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&SessionUpdate) + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer, _)| *observer != id);
        self.observers.len() != before
    }

    pub fn check_for_rooms(&mut self) -> Result<(), SessionError> {
        let operation = Operation::CheckForRooms;
        self.ensure_allowed(
            operation,
            matches!(
                self.status,
                RoomStatus::NotChecked | RoomStatus::Error(_) | RoomStatus::Disconnected
            ),
        )?;
        let Some(device_id) = self.verified_device_id(operation) else {
            return Ok(());
        };
        self.start_matchmaking(operation, move |matchmaker| {
            MatchmakingOutcome::Checked(matchmaker.check_rooms(&device_id))
        });
        Ok(())
    }

    pub fn create_room(&mut self) -> Result<(), SessionError> {
        let operation = Operation::CreateRoom;
        self.ensure_allowed(operation, matches!(self.status, RoomStatus::NoRooms))?;
        let Some(device_id) = self.verified_device_id(operation) else {
            return Ok(());
        };
        self.start_matchmaking(operation, move |matchmaker| {
            MatchmakingOutcome::Room(matchmaker.create_room(&device_id))
        });
        Ok(())
    }

    /// Joins the room named by `code`. Codes are case-insensitive.
    pub fn join_room(&mut self, code: &str) -> Result<(), SessionError> {
        let operation = Operation::JoinRoom;
        let code = RoomCode::parse(code)?;
        self.ensure_allowed(
            operation,
            matches!(
                self.status,
                RoomStatus::NoRooms | RoomStatus::Disconnected | RoomStatus::Error(_)
            ),
        )?;
        let Some(device_id) = self.verified_device_id(operation) else {
            return Ok(());
        };
        self.start_matchmaking(operation, move |matchmaker| {
            MatchmakingOutcome::Room(matchmaker.join_room(&device_id, &code))
        });
        Ok(())
    }

    pub fn close_room(&mut self) -> Result<(), SessionError> {
        let operation = Operation::CloseRoom;
        self.ensure_allowed(
            operation,
            matches!(
                self.status,
                RoomStatus::RoomAvailable(_) | RoomStatus::ConnectedToRoom(_)
            ),
        )?;
        let Some(device_id) = self.verified_device_id(operation) else {
            return Ok(());
        };
        self.start_matchmaking(operation, move |matchmaker| {
            MatchmakingOutcome::Closed(matchmaker.close_room(&device_id))
        });
        Ok(())
    }

    pub fn connect_to_room(&mut self) -> Result<(), SessionError> {
        let operation = Operation::ConnectToRoom;
        let room = match &self.status {
            RoomStatus::RoomAvailable(info) if self.connection.is_none() => Some(info.clone()),
            _ => None,
        };
        self.ensure_allowed(operation, room.is_some())?;
        let Some(room) = room else {
            return Ok(());
        };

        let url = match self.config.link_url(room.link_port) {
            Ok(url) => url,
            Err(e) => {
                self.fail(operation, FailureKind::Connect, e.to_string());
                return Ok(());
            }
        };

        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        let sink = TransportEventSink::new(id, self.events_tx.clone());
        let transport = match self.connector.open(&url, sink) {
            Ok(transport) => transport,
            Err(e) => {
                self.fail(operation, FailureKind::Connect, e.to_string());
                return Ok(());
            }
        };

        info!(
            "Link: connecting to room {} at {url} (connection {id})",
            room.room_code
        );
        self.connection = Some(Connection {
            id,
            transport,
            close_requested: false,
        });
        let key = room.room_key.as_bytes().to_vec();
        self.set_status(RoomStatus::ConnectingToRoom(room));
        // A failed send ends the connection, which reports its own close.
        self.send_link(OutboundMessage::Connect(key));
        Ok(())
    }

    /// Closes the active connection. The session stays busy until the
    /// transport confirms the close.
    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        let operation = Operation::Disconnect;
        let can_close = self
            .connection
            .as_ref()
            .is_some_and(|connection| !connection.close_requested);
        self.ensure_allowed(operation, can_close)?;

        if let Some(connection) = self.connection.as_mut() {
            info!("Link: disconnecting connection {}", connection.id);
            connection.close_requested = true;
            connection.transport.close();
        }
        self.release_on_close = true;
        self.set_working(true);
        Ok(())
    }

    /// Reports the current device registration. A change of verified id
    /// resets the session and force-closes any connection.
    pub fn set_registration(&mut self, registration: RegistrationStatus) {
        let changed = registration.verified_id() != self.registration.verified_id();
        self.registration = registration;
        if !changed {
            return;
        }

        self.epoch += 1;
        self.pending_byte = None;
        info!("Link: device identity changed");

        if self.request_close() {
            self.set_status(RoomStatus::Disconnected);
        } else {
            self.set_status(RoomStatus::NotChecked);
        }
    }

    /// The core exposed a byte for the peer to clock out.
    pub fn on_engine_present_byte(&mut self, byte: u8) {
        if self.is_link_established() && self.send_link(OutboundMessage::PresentByte(byte)) {
            trace!("Link: presented {byte:02X}");
            self.pending_byte = None;
        } else {
            self.pending_byte = Some(byte);
        }
    }

    /// The core clocked a transfer. Without a peer the transfer completes at
    /// once with [`NO_PEER_BYTE`].
    pub fn on_engine_push_byte(&mut self, byte: u8) {
        self.pending_byte = None;
        if self.is_link_established() && self.send_link(OutboundMessage::PushByte(byte)) {
            trace!("Link: pushed {byte:02X}");
            return;
        }
        self.endpoint.receive_pulled_serial_byte(NO_PEER_BYTE);
    }

    /// Handles every queued completion and transport event without blocking.
    pub fn poll_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Blocks until an event arrives or `timeout` elapses, then handles
    /// everything queued.
    pub fn wait_for_event(&mut self, timeout: Duration) -> usize {
        match self.events_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.handle_event(event);
                1 + self.poll_events()
            }
            Err(_) => 0,
        }
    }

    fn ensure_allowed(&self, operation: Operation, allowed: bool) -> Result<(), SessionError> {
        if self.is_working {
            return Err(SessionError::Busy);
        }
        if !allowed {
            return Err(SessionError::NotAllowed {
                operation,
                status: self.status.name(),
            });
        }
        Ok(())
    }

    fn verified_device_id(&mut self, operation: Operation) -> Option<String> {
        match require_verified(&self.registration) {
            Ok(id) => Some(id.to_string()),
            Err(e) => {
                self.fail(operation, e.kind(), e.to_string());
                None
            }
        }
    }

    fn start_matchmaking<F>(&mut self, operation: Operation, request: F)
    where
        F: FnOnce(&dyn Matchmaker) -> MatchmakingOutcome + Send + 'static,
    {
        let matchmaker = Arc::clone(&self.matchmaker);
        let events = self.events_tx.clone();
        let epoch = self.epoch;
        debug!("Link: starting {operation}");

        let spawned = thread::Builder::new()
            .name("link-matchmaking".to_string())
            .spawn(move || {
                let outcome = request(matchmaker.as_ref());
                let _ = events.send(SessionEvent::Matchmaking {
                    epoch,
                    operation,
                    outcome,
                });
            });

        match spawned {
            Ok(_) => self.set_working(true),
            Err(e) => {
                let e = MatchmakingError::Spawn(e);
                self.fail(operation, e.kind(), e.to_string());
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Matchmaking {
                epoch,
                operation,
                outcome,
            } => self.finish_matchmaking(epoch, operation, outcome),
            SessionEvent::Transport { connection, event } => {
                if self.connection.as_ref().map(|c| c.id) != Some(connection) {
                    trace!("Link: ignoring event from old connection {connection}");
                    return;
                }
                match event {
                    TransportEvent::Message(message) => self.handle_message(message),
                    TransportEvent::Closed => self.handle_closed(),
                }
            }
        }
    }

    fn finish_matchmaking(
        &mut self,
        epoch: u64,
        operation: Operation,
        outcome: MatchmakingOutcome,
    ) {
        if epoch != self.epoch {
            debug!("Link: dropping {operation} result from a previous identity");
            self.set_working(false);
            return;
        }

        let result = match outcome {
            MatchmakingOutcome::Checked(Ok(RoomCheck::NotInRoom)) => Ok(RoomStatus::NoRooms),
            MatchmakingOutcome::Checked(Ok(RoomCheck::InRoom(info))) => {
                Ok(RoomStatus::RoomAvailable(info))
            }
            MatchmakingOutcome::Room(Ok(info)) => Ok(RoomStatus::RoomAvailable(info)),
            MatchmakingOutcome::Closed(Ok(())) => {
                self.request_close();
                Ok(RoomStatus::Disconnected)
            }
            MatchmakingOutcome::Closed(Err(e)) => {
                // An error status never carries a live link.
                self.request_close();
                Err(e)
            }
            MatchmakingOutcome::Checked(Err(e)) | MatchmakingOutcome::Room(Err(e)) => Err(e),
        };

        match result {
            Ok(status) => {
                debug!("Link: {operation} finished");
                self.transition(Some(status), false);
            }
            Err(e) => {
                let failure = LinkFailure {
                    operation,
                    kind: e.kind(),
                    message: e.to_string(),
                };
                warn!("Link: {failure}");
                self.transition(Some(RoomStatus::Error(failure)), false);
            }
        }
    }

    fn handle_message(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::DidConnect => {
                if let RoomStatus::ConnectingToRoom(room) = &self.status {
                    info!("Link: relay accepted room {}", room.room_code);
                    let room = room.clone();
                    self.set_status(RoomStatus::ConnectedToRoom(room));
                } else {
                    debug!("Link: handshake ack while {}", self.status.name());
                }
                if let Some(byte) = self.pending_byte.take()
                    && self.is_link_established()
                {
                    trace!("Link: flushing presented {byte:02X}");
                    self.send_link(OutboundMessage::PresentByte(byte));
                }
            }
            InboundMessage::PullByte(byte) | InboundMessage::BytePushed(byte) => {
                self.pending_byte = None;
                trace!("Link: received {byte:02X}");
                self.endpoint.receive_pulled_serial_byte(byte);
            }
            InboundMessage::PullByteStale(byte) | InboundMessage::CommitStaleByte(byte) => {
                self.pending_byte = None;
                trace!("Link: ignoring stale byte {byte:02X} ({message:?})");
            }
        }
    }

    fn handle_closed(&mut self) {
        if let Some(connection) = self.connection.take() {
            info!("Link: connection {} released", connection.id);
        }
        let release = std::mem::take(&mut self.release_on_close);
        let is_working = if release { false } else { self.is_working };
        let status = match self.status {
            RoomStatus::ConnectingToRoom(_) | RoomStatus::ConnectedToRoom(_) => {
                Some(RoomStatus::Disconnected)
            }
            _ => None,
        };
        self.transition(status, is_working);
    }

    /// Requests close of the active connection. Returns whether one exists.
    fn request_close(&mut self) -> bool {
        let Some(connection) = self.connection.as_mut() else {
            return false;
        };
        if !connection.close_requested {
            debug!("Link: closing connection {}", connection.id);
            connection.close_requested = true;
            connection.transport.close();
        }
        true
    }

    fn send_link(&mut self, message: OutboundMessage) -> bool {
        let Some(connection) = self.connection.as_mut() else {
            return false;
        };
        if connection.close_requested {
            return false;
        }
        match connection.transport.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!("Link: send on connection {} failed: {e}", connection.id);
                false
            }
        }
    }

    fn fail(&mut self, operation: Operation, kind: FailureKind, message: String) {
        let failure = LinkFailure {
            operation,
            kind,
            message,
        };
        warn!("Link: {failure}");
        self.transition(Some(RoomStatus::Error(failure)), false);
    }

    fn set_status(&mut self, status: RoomStatus) {
        self.transition(Some(status), self.is_working);
    }

    fn set_working(&mut self, is_working: bool) {
        self.transition(None, is_working);
    }

    fn transition(&mut self, status: Option<RoomStatus>, is_working: bool) {
        let working_changed = self.is_working != is_working;
        self.is_working = is_working;
        match status {
            Some(status) => {
                debug!("Link: status {} -> {status}", self.status);
                self.status = status;
            }
            None if !working_changed => return,
            None => {}
        }

        let update = SessionUpdate {
            status: self.status.clone(),
            is_working: self.is_working,
        };
        for (_, observer) in &mut self.observers {
            observer(&update);
        }
    }
}

impl SerialDestination for LinkSession {
    fn present_byte(&mut self, byte: u8) {
        self.on_engine_present_byte(byte);
    }

    fn push_byte(&mut self, byte: u8) {
        self.on_engine_push_byte(byte);
    }
}
