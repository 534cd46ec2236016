//! INDI protocol client core
//!
//! Sans-IO implementation of the client side of the INDI protocol, sized for
//! telescope mounts: a streaming parser for the XML-like message stream and
//! a session that tracks one device's properties, drives the connection
//! handshake and builds goto commands.
//!
//! ## Features
//!
//! - Incremental framing of top-level INDI elements from arbitrary byte chunks
//! - Defensive parser resets on malformed nesting (driver streams are not trusted)
//! - Property cache with state, permission and number limits
//! - CONNECTION handshake, with gotos accepted once the device is connected
//! - Position reports from `EQUATORIAL_COORD` (J2000) and `EQUATORIAL_EOD_COORD` (JNow)

mod error;
mod parser;
mod protocol;
mod session;

pub use error::{IndiError, IndiResult};
pub use parser::{IndiMessage, IndiParser, VectorKind, VectorMessage, DEFAULT_BUFFER_CAPACITY};
pub use protocol::{coord_elements, messages, standard_properties, INDI_PROTOCOL_VERSION};
pub use session::{CoordinateFrame, IndiSession, SessionEvent};

/// Default INDI server port
pub const INDI_DEFAULT_PORT: u16 = 7624;

/// INDI property types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndiPropertyType {
    Text,
    Number,
    Switch,
    Light,
    Blob,
}

impl IndiPropertyType {
    /// Element tag suffix used on the wire (`defNumberVector`, `oneNumber`, ...)
    pub fn tag_suffix(self) -> &'static str {
        match self {
            IndiPropertyType::Text => "Text",
            IndiPropertyType::Number => "Number",
            IndiPropertyType::Switch => "Switch",
            IndiPropertyType::Light => "Light",
            IndiPropertyType::Blob => "BLOB",
        }
    }

    pub(crate) fn from_tag_suffix(s: &str) -> Option<Self> {
        match s {
            "Text" => Some(IndiPropertyType::Text),
            "Number" => Some(IndiPropertyType::Number),
            "Switch" => Some(IndiPropertyType::Switch),
            "Light" => Some(IndiPropertyType::Light),
            "BLOB" => Some(IndiPropertyType::Blob),
            _ => None,
        }
    }
}

/// INDI property state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndiPropertyState {
    #[default]
    Idle,
    Ok,
    Busy,
    Alert,
}

impl IndiPropertyState {
    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "Ok" => IndiPropertyState::Ok,
            "Busy" => IndiPropertyState::Busy,
            "Alert" => IndiPropertyState::Alert,
            _ => IndiPropertyState::Idle,
        }
    }
}

/// INDI property permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndiPermission {
    ReadOnly,
    WriteOnly,
    #[default]
    ReadWrite,
}

impl IndiPermission {
    pub(crate) fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "ro" => IndiPermission::ReadOnly,
            "wo" => IndiPermission::WriteOnly,
            _ => IndiPermission::ReadWrite,
        }
    }
}

/// Number element limits (min, max, step)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NumberLimits {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub step: Option<f64>,
    pub format: Option<String>,
}

/// An INDI property as last defined by the device
#[derive(Debug, Clone)]
pub struct IndiProperty {
    pub device: String,
    pub name: String,
    pub label: String,
    pub group: String,
    pub property_type: IndiPropertyType,
    pub state: IndiPropertyState,
    pub perm: IndiPermission,
    /// Element names and their latest values, in definition order
    pub elements: Vec<(String, String)>,
}

impl IndiProperty {
    /// Latest raw value of an element
    pub fn value(&self, element: &str) -> Option<&str> {
        self.elements
            .iter()
            .find(|(name, _)| name == element)
            .map(|(_, value)| value.as_str())
    }

    /// Latest value of a number element (sexagesimal values are accepted)
    pub fn number(&self, element: &str) -> Option<f64> {
        self.value(element).and_then(parse_number)
    }

    /// Whether a switch element is On
    pub fn switch(&self, element: &str) -> Option<bool> {
        self.value(element).map(|v| v.trim().eq_ignore_ascii_case("On"))
    }
}

/// Parse an INDI number value.
///
/// Drivers may send plain decimals or sexagesimal strings (`12:30:00`,
/// `-05 30 15`). Returns `None` when the value cannot be read.
pub fn parse_number(value: &str) -> Option<f64> {
    let value = value.trim();
    if let Ok(v) = value.parse::<f64>() {
        return Some(v);
    }

    let negative = value.starts_with('-');
    let parts: Vec<f64> = value
        .trim_start_matches(['-', '+'])
        .split([':', ' '])
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let magnitude = parts
        .iter()
        .enumerate()
        .map(|(i, p)| p / 60f64.powi(i as i32))
        .sum::<f64>();
    Some(if negative { -magnitude } else { magnitude })
}
