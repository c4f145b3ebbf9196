use crossbeam_channel as cb;

/// Byte seen on the serial line when nothing is attached: the input bits
/// float high, so every transfer receives 0xFF.
pub const NO_PEER_BYTE: u8 = 0xFF;

/// Receiver of the bytes the emulation core puts on its serial port while
/// stepping frames.
pub trait SerialDestination {
    /// The core is exposing `byte` for the peer to clock out. Speculative:
    /// a later present or push replaces it.
    fn present_byte(&mut self, byte: u8);

    /// The core is clocking a transfer with `byte` (internal clock).
    fn push_byte(&mut self, byte: u8);
}

/// Injection points on the emulation core for bytes arriving from the peer.
pub trait SerialEndpoint: Send {
    /// Completes a transfer the core clocked itself.
    fn receive_pulled_serial_byte(&mut self, byte: u8);

    /// Completes a transfer the peer clocked while the core was presenting.
    fn receive_pushed_serial_byte(&mut self, byte: u8);
}

/// Endpoint for when no emulator is attached. Every byte is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSerialEndpoint;

impl SerialEndpoint for NullSerialEndpoint {
    fn receive_pulled_serial_byte(&mut self, _byte: u8) {}

    fn receive_pushed_serial_byte(&mut self, _byte: u8) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivedByte {
    Pulled(u8),
    Pushed(u8),
}

impl ReceivedByte {
    pub fn byte(self) -> u8 {
        match self {
            Self::Pulled(byte) | Self::Pushed(byte) => byte,
        }
    }
}

/// Endpoint that forwards every delivery to a channel, for frontends that
/// drive a core from another loop.
#[derive(Debug, Clone)]
pub struct ChannelSerialEndpoint {
    deliveries: cb::Sender<ReceivedByte>,
}

impl ChannelSerialEndpoint {
    pub fn new() -> (Self, cb::Receiver<ReceivedByte>) {
        let (tx, rx) = cb::unbounded();
        (Self { deliveries: tx }, rx)
    }
}

impl SerialEndpoint for ChannelSerialEndpoint {
    fn receive_pulled_serial_byte(&mut self, byte: u8) {
        let _ = self.deliveries.send(ReceivedByte::Pulled(byte));
    }

    fn receive_pushed_serial_byte(&mut self, byte: u8) {
        let _ = self.deliveries.send(ReceivedByte::Pushed(byte));
    }
}
