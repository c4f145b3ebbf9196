#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use linkroom_core::matchmaking::{Matchmaker, MatchmakingError, RoomCheck};
use linkroom_core::protocol::{InboundMessage, OutboundMessage};
use linkroom_core::serial::{ChannelSerialEndpoint, ReceivedByte};
use linkroom_core::transport::{
    LinkTransport, TransportConnector, TransportError, TransportEventSink,
};
use linkroom_core::{
    LinkRoomInfo, LinkSession, RegistrationStatus, RelayConfig, RoomCode, RoomKey,
};
use reqwest::Url;

pub const DEVICE_ID: &str = "device-1";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn verified() -> RegistrationStatus {
    RegistrationStatus::Verified(DEVICE_ID.to_string())
}

pub fn room(code: &str, key: RoomKey, link_port: u16) -> LinkRoomInfo {
    LinkRoomInfo {
        room_code: RoomCode::parse(code).expect("valid room code"),
        room_key: key,
        link_port,
    }
}

pub fn owned_room() -> LinkRoomInfo {
    room("AB12CD", RoomKey::Owner("ownerKey".to_string()), 5000)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Check(String),
    Create(String),
    Join(String, String),
    Close(String),
}

/// Scripted matchmaker. Without a scripted room, create and join fail with a
/// 500 status; close succeeds unless told otherwise.
pub struct FakeMatchmaker {
    calls: Mutex<Vec<Call>>,
    room_check: Mutex<RoomCheck>,
    room: Mutex<Option<LinkRoomInfo>>,
    close_accepted: Mutex<bool>,
    gate: Mutex<Option<cb::Receiver<()>>>,
}

impl FakeMatchmaker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            room_check: Mutex::new(RoomCheck::NotInRoom),
            room: Mutex::new(None),
            close_accepted: Mutex::new(true),
            gate: Mutex::new(None),
        })
    }

    pub fn set_room_check(&self, check: RoomCheck) {
        *self.room_check.lock().expect("room check lock") = check;
    }

    pub fn set_room(&self, room: Option<LinkRoomInfo>) {
        *self.room.lock().expect("room lock") = room;
    }

    pub fn set_close_accepted(&self, accepted: bool) {
        *self.close_accepted.lock().expect("close lock") = accepted;
    }

    /// Makes every following request wait for one message on the returned
    /// sender. Dropping the sender releases all of them.
    pub fn hold(&self) -> cb::Sender<()> {
        let (tx, rx) = cb::unbounded();
        *self.gate.lock().expect("gate lock") = Some(rx);
        tx
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("calls lock").push(call);
        let gate = self.gate.lock().expect("gate lock").clone();
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
    }

    fn scripted_room(&self) -> Result<LinkRoomInfo, MatchmakingError> {
        self.room
            .lock()
            .expect("room lock")
            .clone()
            .ok_or(MatchmakingError::Status(500))
    }
}

impl Matchmaker for FakeMatchmaker {
    fn check_rooms(&self, device_id: &str) -> Result<RoomCheck, MatchmakingError> {
        self.record(Call::Check(device_id.to_string()));
        Ok(self.room_check.lock().expect("room check lock").clone())
    }

    fn create_room(&self, device_id: &str) -> Result<LinkRoomInfo, MatchmakingError> {
        self.record(Call::Create(device_id.to_string()));
        self.scripted_room()
    }

    fn join_room(
        &self,
        device_id: &str,
        code: &RoomCode,
    ) -> Result<LinkRoomInfo, MatchmakingError> {
        self.record(Call::Join(device_id.to_string(), code.to_string()));
        self.scripted_room()
    }

    fn close_room(&self, device_id: &str) -> Result<(), MatchmakingError> {
        self.record(Call::Close(device_id.to_string()));
        if *self.close_accepted.lock().expect("close lock") {
            Ok(())
        } else {
            Err(MatchmakingError::Rejected("room not found".to_string()))
        }
    }
}

#[derive(Default)]
struct RelayState {
    opened: Vec<String>,
    sent: Vec<OutboundMessage>,
    close_requests: usize,
    sink: Option<TransportEventSink>,
    refuse_open: bool,
    refuse_send: bool,
}

/// In-memory relay. The test plays the relay side by delivering messages and
/// closing the connection by hand.
#[derive(Default)]
pub struct FakeRelay {
    state: Mutex<RelayState>,
}

impl FakeRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> Box<dyn TransportConnector> {
        Box::new(FakeConnector(Arc::clone(self)))
    }

    pub fn refuse_open(&self) {
        self.state.lock().expect("relay lock").refuse_open = true;
    }

    pub fn refuse_send(&self) {
        self.state.lock().expect("relay lock").refuse_send = true;
    }

    pub fn deliver(&self, message: InboundMessage) {
        let state = self.state.lock().expect("relay lock");
        let sink = state.sink.as_ref().expect("no open connection");
        assert!(sink.message(message), "session is gone");
    }

    /// Reports the close of the current connection.
    pub fn close(&self) {
        let sink = self
            .state
            .lock()
            .expect("relay lock")
            .sink
            .take()
            .expect("no open connection");
        sink.closed();
    }

    pub fn opened(&self) -> Vec<String> {
        self.state.lock().expect("relay lock").opened.clone()
    }

    pub fn take_sent(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut self.state.lock().expect("relay lock").sent)
    }

    pub fn close_requests(&self) -> usize {
        self.state.lock().expect("relay lock").close_requests
    }
}

struct FakeConnector(Arc<FakeRelay>);

impl TransportConnector for FakeConnector {
    fn open(
        &self,
        url: &Url,
        events: TransportEventSink,
    ) -> Result<Box<dyn LinkTransport>, TransportError> {
        let mut state = self.0.state.lock().expect("relay lock");
        state.opened.push(url.to_string());
        if state.refuse_open {
            return Err(TransportError::InvalidUrl(url.to_string()));
        }
        state.sink = Some(events);
        Ok(Box::new(FakeTransport(Arc::clone(&self.0))))
    }
}

struct FakeTransport(Arc<FakeRelay>);

impl LinkTransport for FakeTransport {
    fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        let mut state = self.0.state.lock().expect("relay lock");
        if state.refuse_send {
            return Err(TransportError::Closed);
        }
        state.sent.push(message);
        Ok(())
    }

    fn close(&mut self) {
        self.0.state.lock().expect("relay lock").close_requests += 1;
    }
}

pub struct Harness {
    pub session: LinkSession,
    pub matchmaker: Arc<FakeMatchmaker>,
    pub relay: Arc<FakeRelay>,
    pub received: cb::Receiver<ReceivedByte>,
}

impl Harness {
    /// Session with a verified identity, fake relay and recording endpoint.
    pub fn new() -> Self {
        init_logging();
        let matchmaker = FakeMatchmaker::new();
        let relay = FakeRelay::new();
        let (endpoint, received) = ChannelSerialEndpoint::new();
        let mut session = LinkSession::new(
            RelayConfig::new("relay.test"),
            matchmaker.clone(),
            relay.connector(),
            Box::new(endpoint),
        );
        session.set_registration(verified());
        Self {
            session,
            matchmaker,
            relay,
            received,
        }
    }

    /// Pumps events until the session is idle.
    pub fn settle(&mut self) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.session.is_working() {
            assert!(Instant::now() < deadline, "session stayed busy");
            self.session.wait_for_event(Duration::from_millis(20));
        }
    }

    /// Pumps whatever is queued right now.
    pub fn pump(&mut self) -> usize {
        self.session.poll_events()
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.try_iter().map(ReceivedByte::byte).collect()
    }

    /// Drives the session from `NotChecked` to `ConnectedToRoom`.
    pub fn connect(&mut self, room: LinkRoomInfo) {
        self.matchmaker.set_room_check(RoomCheck::InRoom(room));
        self.session.check_for_rooms().expect("check allowed");
        self.settle();
        self.session.connect_to_room().expect("connect allowed");
        self.relay.deliver(InboundMessage::DidConnect);
        self.pump();
    }
}
