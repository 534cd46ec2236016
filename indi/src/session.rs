//! INDI client session for one telescope device
//!
//! The session is sans-IO: feed it parsed [`IndiMessage`]s, collect the
//! [`SessionEvent`]s it produces and write whatever [`IndiSession::take_outgoing`]
//! returns to the server. It keeps the property cache of its device and drives
//! the CONNECTION handshake. Gotos are only accepted once the device reports
//! that it is connected; the caller decides what to do with earlier ones.

use crate::error::{IndiError, IndiResult};
use crate::parser::{IndiMessage, VectorKind, VectorMessage};
use crate::protocol::coord_elements::{DEC, RA};
use crate::protocol::messages;
use crate::protocol::standard_properties::*;
use crate::{parse_number, IndiPermission, IndiProperty, IndiPropertyState, NumberLimits};
use std::collections::HashMap;

/// Equinox a coordinate property is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateFrame {
    /// `EQUATORIAL_COORD`
    J2000,
    /// `EQUATORIAL_EOD_COORD` (JNow)
    EquinoxOfDate,
}

impl CoordinateFrame {
    fn property(self) -> &'static str {
        match self {
            CoordinateFrame::J2000 => EQUATORIAL_COORD,
            CoordinateFrame::EquinoxOfDate => EQUATORIAL_EOD_COORD,
        }
    }

    fn request_property(self) -> &'static str {
        match self {
            CoordinateFrame::J2000 => EQUATORIAL_COORD_REQUEST,
            CoordinateFrame::EquinoxOfDate => EQUATORIAL_EOD_COORD_REQUEST,
        }
    }
}

/// What the session observed while handling a message
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Device-side CONNECTION switch changed
    DeviceConnected(bool),
    /// New mount position (RA in hours, Dec in degrees)
    Position {
        ra_hours: f64,
        dec_degrees: f64,
        frame: CoordinateFrame,
        state: IndiPropertyState,
    },
    /// The position property was deleted
    PositionLost,
    PropertyDefined(String),
    PropertyDeleted(String),
    /// Free-form message from the server or driver
    Message(String),
}

/// Client-side state for one INDI telescope device
#[derive(Debug)]
pub struct IndiSession {
    device: String,
    properties: HashMap<String, IndiProperty>,
    number_limits: HashMap<(String, String), NumberLimits>,
    device_connected: bool,
    connect_requested: bool,
    outgoing: Vec<String>,
    server_version: Option<String>,
}

impl IndiSession {
    /// Create a session for the named device
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            properties: HashMap::new(),
            number_limits: HashMap::new(),
            device_connected: false,
            connect_requested: false,
            outgoing: Vec::new(),
            server_version: None,
        }
    }

    /// Get the device name
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Whether the device reports CONNECTION.CONNECT = On
    pub fn is_device_connected(&self) -> bool {
        self.device_connected
    }

    /// Protocol version announced by the server, if any
    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    pub fn property(&self, name: &str) -> Option<&IndiProperty> {
        self.properties.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = &IndiProperty> {
        self.properties.values()
    }

    pub fn number_limits(&self, property: &str, element: &str) -> Option<&NumberLimits> {
        self.number_limits
            .get(&(property.to_string(), element.to_string()))
    }

    /// Begin a session on a freshly opened stream
    pub fn start(&mut self) {
        self.outgoing.push(messages::get_properties(Some(&self.device)));
    }

    /// Forget everything learned from the server
    pub fn reset(&mut self) {
        self.properties.clear();
        self.number_limits.clear();
        self.device_connected = false;
        self.connect_requested = false;
        self.outgoing.clear();
        self.server_version = None;
    }

    /// Commands waiting to be written, oldest first
    pub fn take_outgoing(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outgoing)
    }

    /// Frame the next goto will be expressed in
    pub fn goto_frame(&self) -> CoordinateFrame {
        let has = |frame: CoordinateFrame| {
            self.properties.contains_key(frame.request_property())
                || self.properties.contains_key(frame.property())
        };
        if has(CoordinateFrame::EquinoxOfDate) || !has(CoordinateFrame::J2000) {
            CoordinateFrame::EquinoxOfDate
        } else {
            CoordinateFrame::J2000
        }
    }

    /// Frame the position reports come from, once known
    pub fn position_frame(&self) -> Option<CoordinateFrame> {
        if self.properties.contains_key(EQUATORIAL_EOD_COORD) {
            Some(CoordinateFrame::EquinoxOfDate)
        } else if self.properties.contains_key(EQUATORIAL_COORD) {
            Some(CoordinateFrame::J2000)
        } else {
            None
        }
    }

    /// Slew to coordinates (RA in hours, Dec in degrees) given in `frame`.
    ///
    /// The commands are queued for [`IndiSession::take_outgoing`]. Fails with
    /// [`IndiError::NotConnected`] until the device reports CONNECT = On.
    pub fn goto(&mut self, ra_hours: f64, dec_degrees: f64, frame: CoordinateFrame) -> IndiResult<()> {
        if !self.device_connected {
            return Err(IndiError::NotConnected);
        }
        let property = if self.properties.contains_key(frame.request_property()) {
            frame.request_property()
        } else {
            frame.property()
        };

        if let Some(prop) = self.properties.get(property) {
            if prop.perm == IndiPermission::ReadOnly {
                return Err(IndiError::PermissionDenied(format!(
                    "Property {} is read-only",
                    property
                )));
            }
        }
        self.validate_number_limits(property, RA, ra_hours)?;
        self.validate_number_limits(property, DEC, dec_degrees)?;

        // Set coordinate mode to SLEW (TRACK on drivers without it)
        if let Some(coord_set) = self.properties.get(ON_COORD_SET) {
            let mode = [SLEW, TRACK]
                .into_iter()
                .find(|mode| coord_set.value(mode).is_some());
            if let Some(mode) = mode {
                self.outgoing
                    .push(messages::new_switch(&self.device, ON_COORD_SET, mode));
            }
        }

        self.outgoing.push(messages::new_numbers(
            &self.device,
            property,
            &[(RA, ra_hours), (DEC, dec_degrees)],
        ));
        tracing::info!(
            "INDI goto {} RA={:.4}h Dec={:.4}° via {}",
            self.device,
            ra_hours,
            dec_degrees,
            property
        );
        Ok(())
    }

    fn validate_number_limits(&self, property: &str, element: &str, value: f64) -> IndiResult<()> {
        if let Some(limits) = self.number_limits(property, element) {
            let min = limits.min.unwrap_or(f64::NEG_INFINITY);
            let max = limits.max.unwrap_or(f64::INFINITY);
            // Drivers commonly advertise min == max == 0 for "unbounded"
            if min < max && (value < min || value > max) {
                return Err(IndiError::ValueOutOfRange {
                    device: self.device.clone(),
                    property: property.to_string(),
                    element: element.to_string(),
                    value,
                    min,
                    max,
                });
            }
        }
        Ok(())
    }

    /// Handle one parsed message
    pub fn handle(&mut self, message: IndiMessage) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        match message {
            IndiMessage::GetProperties { version, .. } => {
                if let Some(version) = version {
                    tracing::debug!("INDI server protocol version {}", version);
                    self.server_version = Some(version);
                }
            }
            IndiMessage::Vector(vector) => {
                if vector.device != self.device {
                    tracing::trace!("Ignoring {}.{}", vector.device, vector.name);
                    return events;
                }
                if let Some(text) = vector.message.clone() {
                    events.push(SessionEvent::Message(text));
                }
                match vector.kind {
                    VectorKind::Def => self.handle_definition(vector, &mut events),
                    VectorKind::Set => self.handle_update(vector, &mut events),
                    // Echoes of client requests carry no device state
                    VectorKind::New => {}
                }
            }
            IndiMessage::DelProperty {
                device,
                name,
                message,
            } => {
                if device != self.device {
                    return events;
                }
                if let Some(text) = message {
                    events.push(SessionEvent::Message(text));
                }
                self.handle_delete(name, &mut events);
            }
            IndiMessage::Message { device, text } => {
                if device.as_deref().map_or(true, |d| d == self.device) && !text.is_empty() {
                    events.push(SessionEvent::Message(text));
                }
            }
        }
        events
    }

    fn handle_definition(&mut self, vector: VectorMessage, events: &mut Vec<SessionEvent>) {
        for element in &vector.elements {
            if let Some(limits) = &element.limits {
                self.number_limits.insert(
                    (vector.name.clone(), element.name.clone()),
                    limits.clone(),
                );
            }
        }

        let name = vector.name.clone();
        let property = IndiProperty {
            device: vector.device.clone(),
            name: vector.name.clone(),
            label: vector.label.clone().unwrap_or_else(|| vector.name.clone()),
            group: vector.group.clone().unwrap_or_default(),
            property_type: vector.property_type,
            state: vector.state.unwrap_or_default(),
            perm: vector.perm.unwrap_or_default(),
            elements: vector
                .elements
                .iter()
                .map(|e| (e.name.clone(), e.value.clone()))
                .collect(),
        };
        self.properties.insert(name.clone(), property);
        events.push(SessionEvent::PropertyDefined(name.clone()));

        self.after_change(&name, events);
    }

    fn handle_update(&mut self, vector: VectorMessage, events: &mut Vec<SessionEvent>) {
        let Some(property) = self.properties.get_mut(&vector.name) else {
            tracing::debug!(
                "Update for undefined property {}.{}, ignoring",
                vector.device,
                vector.name
            );
            return;
        };
        if let Some(state) = vector.state {
            property.state = state;
        }
        for element in vector.elements {
            match property.elements.iter_mut().find(|(n, _)| *n == element.name) {
                Some((_, value)) => *value = element.value,
                None => property.elements.push((element.name, element.value)),
            }
        }
        self.after_change(&vector.name, events);
    }

    fn handle_delete(&mut self, name: Option<String>, events: &mut Vec<SessionEvent>) {
        let had_position = self.position_frame().is_some();
        let removed: Vec<String> = match name {
            Some(name) => self.properties.remove(&name).map(|p| p.name).into_iter().collect(),
            None => self.properties.drain().map(|(name, _)| name).collect(),
        };
        for name in removed {
            self.number_limits.retain(|(property, _), _| *property != name);
            if name == CONNECTION && self.device_connected {
                self.device_connected = false;
                self.connect_requested = false;
                events.push(SessionEvent::DeviceConnected(false));
            }
            events.push(SessionEvent::PropertyDeleted(name));
        }
        if had_position && self.position_frame().is_none() {
            events.push(SessionEvent::PositionLost);
        }
    }

    fn after_change(&mut self, name: &str, events: &mut Vec<SessionEvent>) {
        if name == CONNECTION {
            self.update_connection(events);
        } else if Some(name) == self.position_frame().map(CoordinateFrame::property) {
            if let Some(event) = self.position_event(name) {
                events.push(event);
            }
        }
    }

    fn update_connection(&mut self, events: &mut Vec<SessionEvent>) {
        let connected = self
            .properties
            .get(CONNECTION)
            .and_then(|p| p.switch(CONNECT))
            .unwrap_or(false);

        if connected != self.device_connected {
            self.device_connected = connected;
            tracing::info!(
                "INDI device {} {}",
                self.device,
                if connected { "connected" } else { "disconnected" }
            );
            events.push(SessionEvent::DeviceConnected(connected));
        }

        if !connected && !self.connect_requested {
            self.connect_requested = true;
            self.outgoing
                .push(messages::new_switch(&self.device, CONNECTION, CONNECT));
        }
    }

    fn position_event(&self, name: &str) -> Option<SessionEvent> {
        let property = self.properties.get(name)?;
        let frame = if name == EQUATORIAL_EOD_COORD {
            CoordinateFrame::EquinoxOfDate
        } else {
            CoordinateFrame::J2000
        };
        let ra_hours = property.value(RA).and_then(parse_number)?;
        let dec_degrees = property.value(DEC).and_then(parse_number)?;
        Some(SessionEvent::Position {
            ra_hours,
            dec_degrees,
            frame,
            state: property.state,
        })
    }
}
