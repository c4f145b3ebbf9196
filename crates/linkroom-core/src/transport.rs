//! Persistent connection to a room's link port on the relay.
//!
//! A connector opens one [`LinkTransport`] per connection attempt. Incoming
//! frames and the final close are reported through the [`TransportEventSink`]
//! handed to the connector, which feeds the owning session's event queue.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use log::{debug, info, trace, warn};
use reqwest::Url;
use thiserror::Error;
use tungstenite::{Message, WebSocket};

use crate::protocol::{InboundMessage, OutboundMessage};
use crate::session::SessionEvent;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(2);
const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("link URL {0} has no usable host or port")]
    InvalidUrl(String),
    #[error("failed to start link worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("link connection is closed")]
    Closed,
}

/// Identifies one connection attempt within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(InboundMessage),
    Closed,
}

/// Reports one connection's events back to the session that opened it.
pub struct TransportEventSink {
    connection: ConnectionId,
    events: cb::Sender<SessionEvent>,
}

impl TransportEventSink {
    pub(crate) fn new(connection: ConnectionId, events: cb::Sender<SessionEvent>) -> Self {
        Self { connection, events }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Returns false once the session is gone.
    pub fn message(&self, message: InboundMessage) -> bool {
        self.post(TransportEvent::Message(message))
    }

    /// Final event for this connection. Consumes the sink so it can only be
    /// reported once.
    pub fn closed(self) {
        self.post(TransportEvent::Closed);
    }

    fn post(&self, event: TransportEvent) -> bool {
        self.events
            .send(SessionEvent::Transport {
                connection: self.connection,
                event,
            })
            .is_ok()
    }
}

/// An open link connection, as seen from the session.
pub trait LinkTransport: Send {
    /// Queues a frame for the relay.
    fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Asks the connection to shut down. The close is confirmed later through
    /// the event sink. Repeated calls are ignored.
    fn close(&mut self);
}

pub trait TransportConnector {
    /// Starts a connection to `url`. Only setup failures are returned here;
    /// anything that goes wrong afterwards ends with a close event.
    fn open(
        &self,
        url: &Url,
        events: TransportEventSink,
    ) -> Result<Box<dyn LinkTransport>, TransportError>;
}

enum TransportCommand {
    Send(Vec<u8>),
    Close,
}

/// Link transport carrying each frame as one WebSocket binary message.
pub struct WebSocketTransport {
    commands: cb::Sender<TransportCommand>,
    closing: bool,
}

impl LinkTransport for WebSocketTransport {
    fn send(&mut self, message: OutboundMessage) -> Result<(), TransportError> {
        if self.closing {
            return Err(TransportError::Closed);
        }
        self.commands
            .send(TransportCommand::Send(message.encode()))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        let _ = self.commands.send(TransportCommand::Close);
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
    poll_interval: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }
}

impl WebSocketConnector {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }
}

impl TransportConnector for WebSocketConnector {
    fn open(
        &self,
        url: &Url,
        events: TransportEventSink,
    ) -> Result<Box<dyn LinkTransport>, TransportError> {
        let endpoint = LinkEndpoint::from_url(url)
            .ok_or_else(|| TransportError::InvalidUrl(url.to_string()))?;
        let (command_tx, command_rx) = cb::unbounded();
        let connect_timeout = self.connect_timeout;
        let poll_interval = self.poll_interval;

        thread::Builder::new()
            .name(format!("link-{}", events.connection().0))
            .spawn(move || {
                link_thread_main(endpoint, command_rx, events, connect_timeout, poll_interval)
            })
            .map_err(TransportError::Spawn)?;

        Ok(Box::new(WebSocketTransport {
            commands: command_tx,
            closing: false,
        }))
    }
}

struct LinkEndpoint {
    url: String,
    host: String,
    port: u16,
}

impl LinkEndpoint {
    fn from_url(url: &Url) -> Option<Self> {
        Some(Self {
            url: url.to_string(),
            host: url.host_str()?.to_string(),
            port: url.port_or_known_default()?,
        })
    }

    /// IPv6 hosts keep the brackets `Url` gives them, so `host:port` parses.
    fn socket_addr(&self) -> io::Result<SocketAddr> {
        let authority = format!("{}:{}", self.host, self.port);
        if let Ok(addr) = authority.parse::<SocketAddr>() {
            return Ok(addr);
        }

        authority.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address resolved for {authority}"),
            )
        })
    }
}

fn open_socket(
    endpoint: &LinkEndpoint,
    connect_timeout: Duration,
    poll_interval: Duration,
) -> io::Result<WebSocket<TcpStream>> {
    let addr = endpoint.socket_addr()?;
    let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
    let _ = stream.set_nodelay(true);
    stream.set_read_timeout(Some(connect_timeout))?;

    let (socket, _response) = tungstenite::client(endpoint.url.as_str(), stream)
        .map_err(|e| io::Error::other(format!("WebSocket handshake failed: {e}")))?;

    // From here on reads double as the poll tick for outgoing frames.
    socket.get_ref().set_read_timeout(Some(poll_interval))?;
    Ok(socket)
}

fn link_thread_main(
    endpoint: LinkEndpoint,
    commands: cb::Receiver<TransportCommand>,
    events: TransportEventSink,
    connect_timeout: Duration,
    poll_interval: Duration,
) {
    let connection = events.connection();
    debug!("Link: connection {connection} dialing {}", endpoint.url);

    match open_socket(&endpoint, connect_timeout, poll_interval) {
        Ok(mut socket) => {
            info!("Link: connection {connection} open to {}", endpoint.url);
            run_socket(&mut socket, &commands, &events);
        }
        Err(e) => warn!("Link: connection {connection} to {} failed: {e}", endpoint.url),
    }

    info!("Link: connection {connection} closed");
    events.closed();
}

fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn run_socket(
    socket: &mut WebSocket<TcpStream>,
    commands: &cb::Receiver<TransportCommand>,
    events: &TransportEventSink,
) {
    let connection = events.connection();
    loop {
        loop {
            match commands.try_recv() {
                Ok(TransportCommand::Send(frame)) => {
                    trace!("Link: connection {connection} sending {frame:02X?}");
                    if let Err(e) = socket.send(Message::Binary(frame)) {
                        warn!("Link: connection {connection} write failed: {e}");
                        return;
                    }
                }
                Ok(TransportCommand::Close) | Err(cb::TryRecvError::Disconnected) => {
                    finish_close(socket);
                    return;
                }
                Err(cb::TryRecvError::Empty) => break,
            }
        }

        match socket.read() {
            Ok(Message::Binary(frame)) => match InboundMessage::decode(&frame) {
                Ok(message) => {
                    if !events.message(message) {
                        finish_close(socket);
                        return;
                    }
                }
                Err(e) => warn!("Link: connection {connection} dropping frame: {e}"),
            },
            // The reply to a peer close goes out on the next read or flush,
            // which then reports ConnectionClosed.
            Ok(Message::Close(_)) => debug!("Link: connection {connection} closed by relay"),
            Ok(_) => {}
            Err(tungstenite::Error::Io(e)) if is_poll_timeout(&e) => {
                let _ = socket.flush();
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                return;
            }
            Err(e) => {
                warn!("Link: connection {connection} read failed: {e}");
                return;
            }
        }
    }
}

fn finish_close(socket: &mut WebSocket<TcpStream>) {
    if socket.close(None).is_err() {
        return;
    }
    let deadline = Instant::now() + CLOSE_GRACE;
    while Instant::now() < deadline {
        match socket.read() {
            Ok(_) => {}
            Err(tungstenite::Error::Io(e)) if is_poll_timeout(&e) => {
                let _ = socket.flush();
            }
            Err(_) => return,
        }
    }
}
