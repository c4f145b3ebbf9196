use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use linkroom_core::SerialDestination;
use linkroom_core::serial::{NO_PEER_BYTE, ReceivedByte};
use log::{info, trace};

/// Drives a link the way a core would, without an emulator.
///
/// In loopback mode every byte from the peer is pushed straight back.
/// Otherwise the probe clocks out a counter byte every `interval`.
pub struct ProbeEngine {
    deliveries: cb::Receiver<ReceivedByte>,
    loopback: bool,
    interval: Duration,
    next_push: Option<Instant>,
    counter: u8,
    received: u64,
}

impl ProbeEngine {
    pub fn new(deliveries: cb::Receiver<ReceivedByte>, loopback: bool, interval: Duration) -> Self {
        Self {
            deliveries,
            loopback,
            interval,
            next_push: None,
            counter: 0,
            received: 0,
        }
    }

    /// Peer bytes seen so far, not counting idle-line bytes.
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn step(&mut self, link: &mut dyn SerialDestination, now: Instant) {
        let deliveries: Vec<ReceivedByte> = self.deliveries.try_iter().collect();
        for delivery in deliveries {
            let byte = delivery.byte();
            // 0xFF is what an idle line reads; echoing it would spin.
            if byte == NO_PEER_BYTE {
                trace!("Probe: idle line");
                continue;
            }
            self.received += 1;
            info!("Probe: received {byte:02X} ({delivery:?})");
            if self.loopback {
                link.push_byte(byte);
            }
        }

        if self.loopback {
            return;
        }
        let due = self.next_push.is_none_or(|at| now >= at);
        if due {
            link.present_byte(self.counter);
            link.push_byte(self.counter);
            self.counter = self.counter.wrapping_add(1);
            self.next_push = Some(now + self.interval);
        }
    }
}
