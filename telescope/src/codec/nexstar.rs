//! Celestron NexStar hand-controller protocol (hex ASCII over serial)
//!
//! Commands are a single ASCII letter optionally followed by arguments.
//! Angles are fractions of a full turn written as uppercase hex:
//!
//! | variant | get position | answer | goto |
//! |---|---|---|---|
//! | `NexStar` | `E` | `RRRR,DDDD#` | `RRRR,DDDD` after `R`, answered `#` |
//! | `NexStarPrecise` | `e` | `RRRRRRRR,DDDDDDDD#` | same after `r` |
//!
//! The controller handles one command at a time, so at most one command is
//! outstanding and later ones wait.

use super::{Decoded, GotoOutcome, Outbox, Protocol};
use crate::clock::duration_micros;
use crate::config::ControlConfig;
use crate::coordinates::{from_j2000, rect_to_spherical, spherical_to_rect, to_j2000, Equinox};
use crate::error::ProtocolError;
use crate::interpolator::PositionSample;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

const READ_CAPACITY: usize = 120;
const WRITE_CAPACITY: usize = 120;

/// Hand controller generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NexStarVariant {
    /// 16-bit angles
    #[default]
    NexStar,
    /// 32-bit angles
    NexStarPrecise,
}

impl NexStarVariant {
    fn digits(self) -> usize {
        match self {
            NexStarVariant::NexStar => 4,
            NexStarVariant::NexStarPrecise => 8,
        }
    }

    fn full_turn(self) -> f64 {
        2f64.powi(4 * self.digits() as i32)
    }

    fn get_position_command(self) -> u8 {
        match self {
            NexStarVariant::NexStar => b'E',
            NexStarVariant::NexStarPrecise => b'e',
        }
    }

    fn goto_command(self) -> u8 {
        match self {
            NexStarVariant::NexStar => b'R',
            NexStarVariant::NexStarPrecise => b'r',
        }
    }

    /// Length of a position answer without its terminator
    fn position_answer_len(self) -> usize {
        2 * self.digits() + 1
    }
}

fn is_terminator(byte: u8) -> bool {
    byte == b'#' || byte == 0
}

/// Angle as a hex fraction of a full turn
pub fn angle_to_hex(angle: f64, variant: NexStarVariant) -> String {
    let full = variant.full_turn();
    let value = ((angle.rem_euclid(TAU) / TAU) * full).round() % full;
    format!("{:0width$X}", value as u64, width = variant.digits())
}

/// Hex fraction of a full turn as an angle in [0, 2π)
pub fn hex_to_angle(hex: &str, variant: NexStarVariant) -> Option<f64> {
    if hex.len() != variant.digits() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let value = u64::from_str_radix(hex, 16).ok()?;
    Some(value as f64 / variant.full_turn() * TAU)
}

/// Build a goto command for RA/Dec in radians
pub fn goto_command(ra: f64, dec: f64, variant: NexStarVariant) -> Vec<u8> {
    let mut cmd = vec![variant.goto_command()];
    cmd.extend_from_slice(angle_to_hex(ra, variant).as_bytes());
    cmd.push(b',');
    cmd.extend_from_slice(angle_to_hex(dec, variant).as_bytes());
    cmd
}

/// Parse a position answer (terminator removed) into RA/Dec radians.
///
/// Dec values above half a turn are negative.
pub fn parse_position(answer: &[u8], variant: NexStarVariant) -> Option<(f64, f64)> {
    let text = std::str::from_utf8(answer).ok()?;
    let (ra, dec) = text.split_once(',')?;
    let ra = hex_to_angle(ra, variant)?;
    let dec = hex_to_angle(dec, variant)?;
    let dec = if dec > TAU / 2.0 { dec - TAU } else { dec };
    Some((ra, dec))
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    GetPosition,
    Goto(Vec<u8>),
}

impl Command {
    fn bytes(&self, variant: NexStarVariant) -> Vec<u8> {
        match self {
            Command::GetPosition => vec![variant.get_position_command()],
            Command::Goto(cmd) => cmd.clone(),
        }
    }
}

#[derive(Debug)]
struct Outstanding {
    command: Command,
    sent_at: i64,
}

/// Client side of the NexStar protocol
#[derive(Debug)]
pub struct NexStarProtocol {
    variant: NexStarVariant,
    equinox: Equinox,
    poll_interval: i64,
    answer_timeout: i64,
    outstanding: Option<Outstanding>,
    poll_queued: bool,
    queued_goto: Option<Vec<u8>>,
    next_poll_at: i64,
}

impl NexStarProtocol {
    pub fn new(variant: NexStarVariant, equinox: Equinox, config: &ControlConfig) -> Self {
        Self {
            variant,
            equinox,
            poll_interval: duration_micros(config.nexstar_poll_interval()),
            answer_timeout: duration_micros(config.nexstar_answer_timeout()),
            outstanding: None,
            poll_queued: false,
            queued_goto: None,
            next_poll_at: 0,
        }
    }

    pub fn variant(&self) -> NexStarVariant {
        self.variant
    }

    /// Send the next queued command if nothing is awaiting an answer
    fn dispatch(&mut self, now: i64, out: &mut Outbox) {
        if self.outstanding.is_some() {
            return;
        }
        let command = if let Some(goto) = &self.queued_goto {
            Command::Goto(goto.clone())
        } else if self.poll_queued {
            Command::GetPosition
        } else {
            return;
        };
        if !out.push(&command.bytes(self.variant)) {
            return;
        }
        match command {
            Command::Goto(_) => self.queued_goto = None,
            Command::GetPosition => self.poll_queued = false,
        }
        self.outstanding = Some(Outstanding {
            command,
            sent_at: now,
        });
    }

    fn answer_timeout_ms(&self) -> u64 {
        (self.answer_timeout / 1_000).max(0) as u64
    }
}

impl Protocol for NexStarProtocol {
    fn name(&self) -> &'static str {
        match self.variant {
            NexStarVariant::NexStar => "NexStar",
            NexStarVariant::NexStarPrecise => "NexStar (precise)",
        }
    }

    fn read_capacity(&self) -> usize {
        READ_CAPACITY
    }

    fn write_capacity(&self) -> usize {
        WRITE_CAPACITY
    }

    fn on_connected(&mut self, now: i64, out: &mut Outbox) -> Result<(), ProtocolError> {
        self.reset();
        self.next_poll_at = now;
        self.poll(now, out)
    }

    fn poll(&mut self, now: i64, out: &mut Outbox) -> Result<(), ProtocolError> {
        if let Some(outstanding) = &self.outstanding {
            if now - outstanding.sent_at >= self.answer_timeout {
                return Err(ProtocolError::AnswerTimeout(self.answer_timeout_ms()));
            }
        }
        if now >= self.next_poll_at {
            self.poll_queued = true;
            self.next_poll_at = now + self.poll_interval;
        }
        self.dispatch(now, out);
        Ok(())
    }

    fn decode(
        &mut self,
        input: &mut Vec<u8>,
        now: i64,
        out: &mut Outbox,
    ) -> Result<Decoded, ProtocolError> {
        let mut decoded = Decoded::default();
        loop {
            let Some(end) = input.iter().position(|&b| is_terminator(b)) else {
                match &self.outstanding {
                    None if !input.is_empty() => {
                        tracing::warn!("Discarding {} unsolicited bytes", input.len());
                        input.clear();
                    }
                    Some(Outstanding {
                        command: Command::GetPosition,
                        ..
                    }) if input.len() > self.variant.position_answer_len() => {
                        return Err(ProtocolError::MalformedAnswer(
                            String::from_utf8_lossy(input).into_owned(),
                        ));
                    }
                    Some(Outstanding {
                        command: Command::Goto(_),
                        ..
                    }) if !input.is_empty() => {
                        return Err(ProtocolError::MalformedAnswer(
                            String::from_utf8_lossy(input).into_owned(),
                        ));
                    }
                    _ => {}
                }
                break;
            };

            let answer: Vec<u8> = input.drain(..=end).take(end).collect();
            let Some(outstanding) = self.outstanding.take() else {
                tracing::warn!(
                    "Unsolicited answer {:?}",
                    String::from_utf8_lossy(&answer)
                );
                continue;
            };

            match outstanding.command {
                Command::GetPosition => {
                    let (ra, dec) = parse_position(&answer, self.variant).ok_or_else(|| {
                        ProtocolError::MalformedAnswer(String::from_utf8_lossy(&answer).into_owned())
                    })?;
                    let position = to_j2000(&spherical_to_rect(ra, dec), self.equinox, now);
                    decoded.samples.push(PositionSample::new(now, now, position, 0));
                }
                Command::Goto(_) => {
                    if !answer.is_empty() {
                        return Err(ProtocolError::MalformedAnswer(
                            String::from_utf8_lossy(&answer).into_owned(),
                        ));
                    }
                    tracing::debug!("Goto acknowledged");
                }
            }
        }
        self.dispatch(now, out);
        Ok(decoded)
    }

    fn encode_goto(
        &mut self,
        target_j2000: &Vector3<f64>,
        now: i64,
        out: &mut Outbox,
    ) -> Result<GotoOutcome, ProtocolError> {
        let (ra, dec) = rect_to_spherical(&from_j2000(target_j2000, self.equinox, now));
        if self.queued_goto.replace(goto_command(ra, dec, self.variant)).is_some() {
            tracing::debug!("Replacing queued goto");
        }
        self.dispatch(now, out);
        Ok(GotoOutcome::Queued)
    }

    fn streams_positions(&self) -> bool {
        true
    }

    fn reset(&mut self) {
        self.outstanding = None;
        self.poll_queued = false;
        self.queued_goto = None;
        self.next_poll_at = 0;
    }
}
