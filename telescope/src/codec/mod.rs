//! Per-protocol framing
//!
//! A [`Protocol`] turns received bytes into position samples and goto
//! targets into outgoing bytes. It never touches a transport: the owning
//! connection moves bytes between the link and the buffers handed in here.

pub mod indi;
pub mod nexstar;
pub mod stellarium;

use crate::error::ProtocolError;
use crate::interpolator::PositionSample;
use nalgebra::Vector3;

pub use indi::IndiProtocol;
pub use nexstar::{NexStarProtocol, NexStarVariant};
pub use stellarium::StellariumProtocol;

/// Bounded outgoing byte buffer
#[derive(Debug, Clone)]
pub struct Outbox {
    buf: Vec<u8>,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Append a whole command, or nothing if it does not fit
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.buf.extend_from_slice(bytes);
        true
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop the first `n` bytes after they were written
    pub fn consume(&mut self, n: usize) {
        self.buf.drain(..n.min(self.buf.len()));
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Result of handing a goto to a protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GotoOutcome {
    /// Bytes are in the outbox (or queued inside the protocol)
    Queued,
    /// The outbox cannot take the command right now
    NoRoom,
    /// The protocol keeps it until the device is ready
    Held,
}

/// What one decode pass produced
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Decoded {
    pub samples: Vec<PositionSample>,
    /// The device withdrew its position; earlier samples no longer apply
    pub position_lost: bool,
}

pub trait Protocol: Send {
    fn name(&self) -> &'static str;

    /// Upper bound on buffered unread bytes
    fn read_capacity(&self) -> usize;

    /// Outgoing buffer size
    fn write_capacity(&self) -> usize;

    /// The transport became established
    fn on_connected(&mut self, now: i64, out: &mut Outbox) -> Result<(), ProtocolError>;

    /// Consume complete frames from `input`; partial frames stay buffered
    fn decode(
        &mut self,
        input: &mut Vec<u8>,
        now: i64,
        out: &mut Outbox,
    ) -> Result<Decoded, ProtocolError>;

    /// Periodic work (polls, answer timeouts)
    fn poll(&mut self, _now: i64, _out: &mut Outbox) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Encode a slew to a J2000 direction
    fn encode_goto(
        &mut self,
        target_j2000: &Vector3<f64>,
        now: i64,
        out: &mut Outbox,
    ) -> Result<GotoOutcome, ProtocolError>;

    /// Device-level readiness on top of an established link
    fn is_ready(&self) -> bool {
        true
    }

    /// Whether the device sends data continuously (idle links count as lost)
    fn streams_positions(&self) -> bool;

    /// Whether gotos issued while disconnected are kept for later
    fn holds_goto_offline(&self) -> bool {
        false
    }

    /// Drop all per-link state
    fn reset(&mut self);
}
