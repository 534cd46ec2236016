//! Stellarium telescope protocol (binary, over TCP)
//!
//! Every message starts with a little-endian `u16` total length and `u16`
//! type. Type 0 from the server is a position report:
//!
//! ```text
//! u16 len = 24 | u16 type = 0 | i64 server_micros | u32 ra | i32 dec | i32 status
//! ```
//!
//! and type 0 from the client is a goto:
//!
//! ```text
//! u16 len = 20 | u16 type = 0 | i64 client_micros | u32 ra | i32 dec
//! ```
//!
//! RA covers a full turn over the `u32` range, Dec a half turn each way over
//! the `i32` range.

use super::{Decoded, GotoOutcome, Outbox, Protocol};
use crate::coordinates::{from_j2000, rect_to_spherical, spherical_to_rect, to_j2000, Equinox};
use crate::error::ProtocolError;
use crate::interpolator::PositionSample;
use nalgebra::Vector3;
use std::f64::consts::{PI, TAU};

/// Read and write buffer size
pub const BUFFER_CAPACITY: usize = 120;
pub const HEADER_LEN: usize = 4;
pub const POSITION_LEN: usize = 24;
pub const GOTO_LEN: usize = 20;
pub const MSG_TYPE_POSITION: u16 = 0;

const SCALE: f64 = 2_147_483_648.0; // 0x80000000

/// Decoded type-0 server message
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionMessage {
    pub server_micros: i64,
    pub ra: f64,
    pub dec: f64,
    pub status: i32,
}

/// Decoded type-0 client message
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GotoMessage {
    pub client_micros: i64,
    pub ra: f64,
    pub dec: f64,
}

pub fn ra_to_wire(ra: f64) -> u32 {
    // Integer casts wrap, so 2π rounds back to 0
    (ra.rem_euclid(TAU) * SCALE / PI).round() as u64 as u32
}

pub fn ra_from_wire(ra: u32) -> f64 {
    ra as f64 * PI / SCALE
}

pub fn dec_to_wire(dec: f64) -> i32 {
    (dec.clamp(-PI / 2.0, PI / 2.0) * SCALE / PI).round() as i32
}

pub fn dec_from_wire(dec: i32) -> f64 {
    dec as f64 * PI / SCALE
}

pub fn encode_goto(client_micros: i64, ra: f64, dec: f64) -> [u8; GOTO_LEN] {
    let mut frame = [0u8; GOTO_LEN];
    frame[0..2].copy_from_slice(&(GOTO_LEN as u16).to_le_bytes());
    frame[2..4].copy_from_slice(&MSG_TYPE_POSITION.to_le_bytes());
    frame[4..12].copy_from_slice(&client_micros.to_le_bytes());
    frame[12..16].copy_from_slice(&ra_to_wire(ra).to_le_bytes());
    frame[16..20].copy_from_slice(&dec_to_wire(dec).to_le_bytes());
    frame
}

pub fn encode_position(server_micros: i64, ra: f64, dec: f64, status: i32) -> [u8; POSITION_LEN] {
    let mut frame = [0u8; POSITION_LEN];
    frame[0..2].copy_from_slice(&(POSITION_LEN as u16).to_le_bytes());
    frame[2..4].copy_from_slice(&MSG_TYPE_POSITION.to_le_bytes());
    frame[4..12].copy_from_slice(&server_micros.to_le_bytes());
    frame[12..16].copy_from_slice(&ra_to_wire(ra).to_le_bytes());
    frame[16..20].copy_from_slice(&dec_to_wire(dec).to_le_bytes());
    frame[20..24].copy_from_slice(&status.to_le_bytes());
    frame
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_i64(bytes: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    i64::from_le_bytes(raw)
}

/// Decode a complete type-0 server frame
pub fn decode_position(frame: &[u8]) -> Result<PositionMessage, ProtocolError> {
    if frame.len() < POSITION_LEN {
        return Err(ProtocolError::ShortPositionFrame(frame.len()));
    }
    Ok(PositionMessage {
        server_micros: read_i64(frame, 4),
        ra: ra_from_wire(read_u32(frame, 12)),
        dec: dec_from_wire(read_u32(frame, 16) as i32),
        status: read_u32(frame, 20) as i32,
    })
}

/// Decode a complete type-0 client frame
pub fn decode_goto(frame: &[u8]) -> Result<GotoMessage, ProtocolError> {
    if frame.len() < GOTO_LEN {
        return Err(ProtocolError::MalformedAnswer(format!(
            "goto frame of {} bytes",
            frame.len()
        )));
    }
    Ok(GotoMessage {
        client_micros: read_i64(frame, 4),
        ra: ra_from_wire(read_u32(frame, 12)),
        dec: dec_from_wire(read_u32(frame, 16) as i32),
    })
}

/// Split complete frames off the front of `input`.
///
/// Returns `(type, frame)` pairs; a partial trailing frame stays in `input`.
/// A length field outside `[4, capacity]` is fatal since the stream cannot
/// be resynchronized.
pub fn split_frames(input: &mut Vec<u8>, capacity: usize) -> Result<Vec<(u16, Vec<u8>)>, ProtocolError> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while input.len() - offset >= 2 {
        let length = read_u16(input, offset) as usize;
        if !(HEADER_LEN..=capacity).contains(&length) {
            return Err(ProtocolError::FrameLength { length, capacity });
        }
        if input.len() - offset < length {
            break;
        }
        let msg_type = read_u16(input, offset + 2);
        frames.push((msg_type, input[offset..offset + length].to_vec()));
        offset += length;
    }
    input.drain(..offset);
    Ok(frames)
}

/// Client side of the Stellarium protocol
#[derive(Debug)]
pub struct StellariumProtocol {
    equinox: Equinox,
}

impl StellariumProtocol {
    /// `equinox` is the frame the server reports and accepts
    pub fn new(equinox: Equinox) -> Self {
        Self { equinox }
    }
}

impl Protocol for StellariumProtocol {
    fn name(&self) -> &'static str {
        "Stellarium TCP"
    }

    fn read_capacity(&self) -> usize {
        BUFFER_CAPACITY
    }

    fn write_capacity(&self) -> usize {
        BUFFER_CAPACITY
    }

    fn on_connected(&mut self, _now: i64, _out: &mut Outbox) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn decode(
        &mut self,
        input: &mut Vec<u8>,
        now: i64,
        _out: &mut Outbox,
    ) -> Result<Decoded, ProtocolError> {
        let mut decoded = Decoded::default();
        for (msg_type, frame) in split_frames(input, BUFFER_CAPACITY)? {
            if msg_type != MSG_TYPE_POSITION {
                tracing::debug!("Skipping Stellarium message type {} ({} bytes)", msg_type, frame.len());
                continue;
            }
            let msg = decode_position(&frame)?;
            let position = to_j2000(&spherical_to_rect(msg.ra, msg.dec), self.equinox, now);
            tracing::trace!(
                "Position ra={:.6} dec={:.6} status={} server_time={}",
                msg.ra,
                msg.dec,
                msg.status,
                msg.server_micros
            );
            decoded
                .samples
                .push(PositionSample::new(now, msg.server_micros, position, msg.status));
        }
        Ok(decoded)
    }

    fn encode_goto(
        &mut self,
        target_j2000: &Vector3<f64>,
        now: i64,
        out: &mut Outbox,
    ) -> Result<GotoOutcome, ProtocolError> {
        let (ra, dec) = rect_to_spherical(&from_j2000(target_j2000, self.equinox, now));
        if out.push(&encode_goto(now, ra, dec)) {
            Ok(GotoOutcome::Queued)
        } else {
            Ok(GotoOutcome::NoRoom)
        }
    }

    fn streams_positions(&self) -> bool {
        true
    }

    fn reset(&mut self) {}
}
