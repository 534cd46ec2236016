//! INDI error types
//!
//! Provides structured error types for INDI operations.

use std::fmt;

/// INDI client errors
#[derive(Debug, Clone, PartialEq)]
pub enum IndiError {
    /// XML parse error inside one complete message
    ParseError(String),
    /// Element nesting or type did not match the current parse state
    UnexpectedElement { found: String, context: String },
    /// A single message grew past the parser's buffer capacity
    BufferOverflow { capacity: usize, buffered: usize },
    /// Property not found
    PropertyNotFound { device: String, property: String },
    /// Permission denied (attempted to write to read-only property)
    PermissionDenied(String),
    /// Value could not be read as the expected type
    InvalidValue { property: String, element: String, value: String },
    /// Property value out of range
    ValueOutOfRange {
        device: String,
        property: String,
        element: String,
        value: f64,
        min: f64,
        max: f64,
    },
    /// Device reported that it is not connected
    NotConnected,
}

impl std::error::Error for IndiError {}

impl fmt::Display for IndiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndiError::ParseError(msg) => write!(f, "XML parse error: {}", msg),
            IndiError::UnexpectedElement { found, context } => {
                write!(f, "Unexpected element <{}> {}", found, context)
            }
            IndiError::BufferOverflow { capacity, buffered } => {
                write!(
                    f,
                    "INDI message exceeds buffer capacity: {} bytes buffered, capacity {}",
                    buffered, capacity
                )
            }
            IndiError::PropertyNotFound { device, property } => {
                write!(f, "Property not found: {}.{}", device, property)
            }
            IndiError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            IndiError::InvalidValue {
                property,
                element,
                value,
            } => {
                write!(f, "Invalid value '{}' for {}.{}", value, property, element)
            }
            IndiError::ValueOutOfRange {
                device,
                property,
                element,
                value,
                min,
                max,
            } => {
                write!(
                    f,
                    "Value {} out of range [{}, {}] for {}.{}.{}",
                    value, min, max, device, property, element
                )
            }
            IndiError::NotConnected => write!(f, "Device not connected"),
        }
    }
}

impl From<quick_xml::Error> for IndiError {
    fn from(err: quick_xml::Error) -> Self {
        IndiError::ParseError(err.to_string())
    }
}

impl From<IndiError> for String {
    fn from(err: IndiError) -> String {
        err.to_string()
    }
}

/// Result type for INDI operations
pub type IndiResult<T> = Result<T, IndiError>;
