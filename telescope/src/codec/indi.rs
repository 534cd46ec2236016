//! INDI mounts behind the generic protocol interface
//!
//! Works over any byte stream that speaks INDI: a TCP connection to an
//! indiserver or the stdio of a locally started driver.
//!
//! A goto issued before the device reports CONNECT = On is kept as a J2000
//! direction. The coordinate property and the precession are chosen when it
//! is finally sent, from whatever the device has defined by then.

use super::{Decoded, GotoOutcome, Outbox, Protocol};
use crate::config::ControlConfig;
use crate::coordinates::{
    from_j2000, hours_to_radians, radians_to_hours, rect_to_spherical, spherical_to_rect, to_j2000,
    Equinox,
};
use crate::error::ProtocolError;
use crate::interpolator::PositionSample;
use nalgebra::Vector3;
use scopelink_indi::{CoordinateFrame, IndiParser, IndiSession, SessionEvent};
use std::collections::VecDeque;

fn equinox_of(frame: CoordinateFrame) -> Equinox {
    match frame {
        CoordinateFrame::J2000 => Equinox::J2000,
        CoordinateFrame::EquinoxOfDate => Equinox::JNow,
    }
}

#[derive(Debug)]
pub struct IndiProtocol {
    session: IndiSession,
    parser: IndiParser,
    write_capacity: usize,
    /// Session output still waiting for room in the outbox, oldest first
    unsent: VecDeque<String>,
    /// J2000 target waiting for the device to connect
    held_goto: Option<Vector3<f64>>,
}

impl IndiProtocol {
    pub fn new(device: &str, config: &ControlConfig) -> Self {
        Self {
            session: IndiSession::new(device),
            parser: IndiParser::with_capacity(config.indi_buffer_capacity),
            write_capacity: config.indi_outbox_capacity,
            unsent: VecDeque::new(),
            held_goto: None,
        }
    }

    pub fn session(&self) -> &IndiSession {
        &self.session
    }

    /// Parser resets caused by malformed input so far
    pub fn parser_resets(&self) -> u64 {
        self.parser.resets()
    }

    pub fn has_held_goto(&self) -> bool {
        self.held_goto.is_some()
    }

    /// Move as much session output into the outbox as fits, in order
    fn flush(&mut self, out: &mut Outbox) -> Result<(), ProtocolError> {
        self.unsent.extend(self.session.take_outgoing());
        while let Some(message) = self.unsent.front() {
            if !out.push(message.as_bytes()) {
                if message.len() > out.capacity() {
                    return Err(ProtocolError::OutboxOverflow);
                }
                tracing::debug!(
                    "{}: outgoing buffer full, {} messages wait",
                    self.session.device(),
                    self.unsent.len()
                );
                break;
            }
            self.unsent.pop_front();
        }
        Ok(())
    }

    /// Convert to the device's frame as of `now` and queue the slew
    fn send_goto(
        &mut self,
        target_j2000: &Vector3<f64>,
        now: i64,
        out: &mut Outbox,
    ) -> Result<GotoOutcome, ProtocolError> {
        let frame = self.session.goto_frame();
        let (ra, dec) = rect_to_spherical(&from_j2000(target_j2000, equinox_of(frame), now));
        self.session.goto(radians_to_hours(ra), dec.to_degrees(), frame)?;

        let messages = self.session.take_outgoing();
        let total: usize = messages.iter().map(String::len).sum();
        if !self.unsent.is_empty() || total > out.remaining() {
            // The connection keeps the target and asks again
            return Ok(GotoOutcome::NoRoom);
        }
        for message in messages {
            out.push(message.as_bytes());
        }
        Ok(GotoOutcome::Queued)
    }

    fn replay_held_goto(&mut self, now: i64, out: &mut Outbox) {
        if !self.session.is_device_connected() {
            return;
        }
        let Some(target) = self.held_goto.take() else {
            return;
        };
        match self.send_goto(&target, now, out) {
            Ok(GotoOutcome::NoRoom) => self.held_goto = Some(target),
            Ok(_) => tracing::info!("Replayed held goto for {}", self.session.device()),
            Err(e) => tracing::warn!("Held goto for {} rejected: {}", self.session.device(), e),
        }
    }
}

impl Protocol for IndiProtocol {
    fn name(&self) -> &'static str {
        "INDI"
    }

    fn read_capacity(&self) -> usize {
        // The parser keeps partial messages itself
        64 * 1024
    }

    fn write_capacity(&self) -> usize {
        self.write_capacity
    }

    fn on_connected(&mut self, _now: i64, out: &mut Outbox) -> Result<(), ProtocolError> {
        self.session.start();
        self.flush(out)
    }

    fn decode(
        &mut self,
        input: &mut Vec<u8>,
        now: i64,
        out: &mut Outbox,
    ) -> Result<Decoded, ProtocolError> {
        let mut decoded = Decoded::default();
        let messages = self.parser.feed(input);
        input.clear();

        for message in messages {
            for event in self.session.handle(message) {
                match event {
                    SessionEvent::Position {
                        ra_hours,
                        dec_degrees,
                        frame,
                        ..
                    } => {
                        let v = spherical_to_rect(hours_to_radians(ra_hours), dec_degrees.to_radians());
                        let position = to_j2000(&v, equinox_of(frame), now);
                        decoded.samples.push(PositionSample::new(now, now, position, 0));
                    }
                    SessionEvent::PositionLost => decoded.position_lost = true,
                    SessionEvent::DeviceConnected(connected) => {
                        tracing::info!(
                            "INDI device {} reports {}",
                            self.session.device(),
                            if connected { "connected" } else { "disconnected" }
                        );
                        if !connected {
                            decoded.position_lost = true;
                        }
                    }
                    SessionEvent::Message(text) => {
                        tracing::info!("[{}] {}", self.session.device(), text);
                    }
                    SessionEvent::PropertyDefined(name) => {
                        tracing::debug!("{} defined {}", self.session.device(), name);
                    }
                    SessionEvent::PropertyDeleted(name) => {
                        tracing::debug!("{} deleted {}", self.session.device(), name);
                    }
                }
            }
        }
        self.flush(out)?;
        self.replay_held_goto(now, out);
        Ok(decoded)
    }

    fn poll(&mut self, now: i64, out: &mut Outbox) -> Result<(), ProtocolError> {
        self.flush(out)?;
        self.replay_held_goto(now, out);
        Ok(())
    }

    fn encode_goto(
        &mut self,
        target_j2000: &Vector3<f64>,
        now: i64,
        out: &mut Outbox,
    ) -> Result<GotoOutcome, ProtocolError> {
        if !self.session.is_device_connected() {
            if self.held_goto.replace(*target_j2000).is_some() {
                tracing::debug!("Replacing held goto for {}", self.session.device());
            }
            return Ok(GotoOutcome::Held);
        }
        self.send_goto(target_j2000, now, out)
    }

    fn is_ready(&self) -> bool {
        self.session.is_device_connected()
    }

    fn streams_positions(&self) -> bool {
        false
    }

    fn holds_goto_offline(&self) -> bool {
        true
    }

    fn reset(&mut self) {
        self.session.reset();
        self.parser.reset();
        self.unsent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const DEVICE: &str = "Telescope Simulator";

    const HANDSHAKE: &str = r#"<defSwitchVector device="Telescope Simulator" name="CONNECTION" perm="rw" rule="OneOfMany"><defSwitch name="CONNECT">Off</defSwitch><defSwitch name="DISCONNECT">On</defSwitch></defSwitchVector>
<defNumberVector device="Telescope Simulator" name="EQUATORIAL_COORD" perm="rw"><defNumber name="RA" min="0" max="24">0</defNumber><defNumber name="DEC" min="-90" max="90">0</defNumber></defNumberVector>"#;

    const CONNECTED: &str = r#"<setSwitchVector device="Telescope Simulator" name="CONNECTION" state="Ok"><oneSwitch name="CONNECT">On</oneSwitch><oneSwitch name="DISCONNECT">Off</oneSwitch></setSwitchVector>"#;

    fn connected_protocol() -> (IndiProtocol, Outbox) {
        let mut protocol = IndiProtocol::new(DEVICE, &ControlConfig::default());
        let mut out = Outbox::new(protocol.write_capacity());
        protocol.on_connected(0, &mut out).unwrap();
        let mut input = format!("{}{}", HANDSHAKE, CONNECTED).into_bytes();
        protocol.decode(&mut input, 0, &mut out).unwrap();
        (protocol, out)
    }

    #[test]
    fn test_handshake_sends_get_properties_and_connect() {
        let mut protocol = IndiProtocol::new(DEVICE, &ControlConfig::default());
        let mut out = Outbox::new(protocol.write_capacity());
        protocol.on_connected(0, &mut out).unwrap();
        assert!(std::str::from_utf8(out.as_slice()).unwrap().starts_with("<getProperties"));
        out.clear();

        let mut input = HANDSHAKE.as_bytes().to_vec();
        protocol.decode(&mut input, 0, &mut out).unwrap();
        assert!(input.is_empty());
        let sent = String::from_utf8(out.as_slice().to_vec()).unwrap();
        assert!(sent.contains("<oneSwitch name=\"CONNECT\">On</oneSwitch>"));
        assert!(!protocol.is_ready());
    }

    #[test]
    fn test_position_updates_become_samples() {
        let (mut protocol, mut out) = connected_protocol();
        assert!(protocol.is_ready());
        let mut input = br#"<setNumberVector device="Telescope Simulator" name="EQUATORIAL_COORD" state="Ok"><oneNumber name="RA">6</oneNumber><oneNumber name="DEC">45</oneNumber></setNumberVector>"#.to_vec();
        let decoded = protocol.decode(&mut input, 1_000, &mut out).unwrap();
        assert_eq!(decoded.samples.len(), 1);
        let (ra, dec) = rect_to_spherical(&decoded.samples[0].position);
        assert_relative_eq!(ra, hours_to_radians(6.0), epsilon = 1e-12);
        assert_relative_eq!(dec, 45f64.to_radians(), epsilon = 1e-12);
    }

    #[test]
    fn test_goto_uses_device_frame() {
        let (mut protocol, mut out) = connected_protocol();
        out.clear();
        let target = spherical_to_rect(hours_to_radians(6.0), 23.5f64.to_radians());
        assert_eq!(protocol.encode_goto(&target, 0, &mut out), Ok(GotoOutcome::Queued));
        let sent = String::from_utf8(out.as_slice().to_vec()).unwrap();
        assert!(sent.contains("name=\"EQUATORIAL_COORD\""), "{}", sent);
    }

    #[test]
    fn test_goto_without_room_is_not_lost() {
        let (mut protocol, _) = connected_protocol();
        let mut small = Outbox::new(16);
        let target = spherical_to_rect(1.0, 0.2);
        assert_eq!(protocol.encode_goto(&target, 0, &mut small), Ok(GotoOutcome::NoRoom));
        assert!(small.is_empty());
    }

    /// Value of one number element in the last message that carries it
    fn sent_number(sent: &str, element: &str) -> f64 {
        let open = format!("<oneNumber name=\"{}\">", element);
        let start = sent.rfind(&open).unwrap() + open.len();
        let end = start + sent[start..].find('<').unwrap();
        sent[start..end].parse().unwrap()
    }

    #[test]
    fn test_goto_before_device_connects_is_held() {
        let mut protocol = IndiProtocol::new(DEVICE, &ControlConfig::default());
        let mut out = Outbox::new(protocol.write_capacity());
        let target = spherical_to_rect(1.0, 0.2);
        assert_eq!(protocol.encode_goto(&target, 0, &mut out), Ok(GotoOutcome::Held));
        assert!(out.is_empty());
        protocol.reset();
        assert!(protocol.has_held_goto());

        protocol.on_connected(0, &mut out).unwrap();
        let mut input = format!("{}{}", HANDSHAKE, CONNECTED).into_bytes();
        out.clear();
        protocol.decode(&mut input, 0, &mut out).unwrap();
        assert!(!protocol.has_held_goto());

        // Only EQUATORIAL_COORD was defined, so the target goes out unprecessed
        let sent = String::from_utf8(out.as_slice().to_vec()).unwrap();
        assert!(sent.contains("<newNumberVector device=\"Telescope Simulator\" name=\"EQUATORIAL_COORD\">"), "{}", sent);
        assert!(!sent.contains("EQUATORIAL_EOD_COORD"), "{}", sent);
        assert_relative_eq!(sent_number(&sent, "RA"), radians_to_hours(1.0), epsilon = 1e-12);
        assert_relative_eq!(sent_number(&sent, "DEC"), 0.2f64.to_degrees(), epsilon = 1e-12);
    }

    #[test]
    fn test_held_goto_is_precessed_when_sent() {
        const EOD_HANDSHAKE: &str = r#"<defSwitchVector device="Telescope Simulator" name="CONNECTION" perm="rw" rule="OneOfMany"><defSwitch name="CONNECT">On</defSwitch><defSwitch name="DISCONNECT">Off</defSwitch></defSwitchVector>
<defNumberVector device="Telescope Simulator" name="EQUATORIAL_EOD_COORD" perm="rw"><defNumber name="RA" min="0" max="24">0</defNumber><defNumber name="DEC" min="-90" max="90">0</defNumber></defNumberVector>"#;
        // 2001-09-09 and 2023-11-14
        let held_at = 1_000_000_000_000_000;
        let sent_at = 1_700_000_000_000_000;

        let mut protocol = IndiProtocol::new(DEVICE, &ControlConfig::default());
        let mut out = Outbox::new(protocol.write_capacity());
        let target = spherical_to_rect(4.0, -0.3);
        assert_eq!(protocol.encode_goto(&target, held_at, &mut out), Ok(GotoOutcome::Held));

        protocol.on_connected(sent_at, &mut out).unwrap();
        let mut input = EOD_HANDSHAKE.as_bytes().to_vec();
        out.clear();
        protocol.decode(&mut input, sent_at, &mut out).unwrap();

        let sent = String::from_utf8(out.as_slice().to_vec()).unwrap();
        assert!(sent.contains("name=\"EQUATORIAL_EOD_COORD\""), "{}", sent);
        let (ra, dec) = rect_to_spherical(&from_j2000(&target, Equinox::JNow, sent_at));
        assert_relative_eq!(sent_number(&sent, "RA"), radians_to_hours(ra), epsilon = 1e-9);
        assert_relative_eq!(sent_number(&sent, "DEC"), dec.to_degrees(), epsilon = 1e-9);
        let (ra_when_held, _) = rect_to_spherical(&from_j2000(&target, Equinox::JNow, held_at));
        assert!((sent_number(&sent, "RA") - radians_to_hours(ra_when_held)).abs() > 1e-3);
    }

    #[test]
    fn test_full_outbox_delays_messages_without_error() {
        let mut protocol = IndiProtocol::new(DEVICE, &ControlConfig::default());
        // Room for getProperties but not the CONNECT request behind it
        let mut out = Outbox::new(150);
        protocol.on_connected(0, &mut out).unwrap();
        let mut input = format!("{}{}", HANDSHAKE, CONNECTED).into_bytes();
        assert!(protocol.decode(&mut input, 0, &mut out).is_ok());
        let sent = String::from_utf8(out.as_slice().to_vec()).unwrap();
        assert!(sent.starts_with("<getProperties"));
        assert!(!sent.contains("CONNECTION"));

        // A goto may not overtake the waiting request
        let target = spherical_to_rect(1.0, 0.2);
        out.clear();
        assert_eq!(protocol.encode_goto(&target, 0, &mut out), Ok(GotoOutcome::NoRoom));

        protocol.poll(0, &mut out).unwrap();
        let sent = String::from_utf8(out.as_slice().to_vec()).unwrap();
        assert!(sent.contains("<oneSwitch name=\"CONNECT\">On</oneSwitch>"), "{}", sent);

        // Nothing waits any more; a buffer with room takes the goto
        let mut roomy = Outbox::new(1024);
        assert_eq!(protocol.encode_goto(&target, 0, &mut roomy), Ok(GotoOutcome::Queued));
        let sent = String::from_utf8(roomy.as_slice().to_vec()).unwrap();
        assert!(sent.contains("name=\"EQUATORIAL_COORD\""), "{}", sent);
    }

    #[test]
    fn test_malformed_stream_resets_parser_without_error() {
        let (mut protocol, mut out) = connected_protocol();
        let mut input = br#"<setNumberVector device="Telescope Simulator" name="EQUATORIAL_COORD"><oneSwitch name="RA">On</oneSwitch></setNumberVector>"#.to_vec();
        assert!(protocol.decode(&mut input, 0, &mut out).is_ok());
        assert!(protocol.parser_resets() >= 1);
        assert!(protocol.is_ready());
    }
}
