//! Error types for telescope connections
//!
//! Configuration problems are reported synchronously to the caller. Link and
//! protocol failures never reach the host as fatal errors: a connection that
//! hits one disconnects itself and reports the cause from its `step()`.

use scopelink_indi::IndiError;
use thiserror::Error;

/// Rejected profile or registry operation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Profile name must not be empty")]
    EmptyName,

    #[error("Profile name {0:?} contains a reserved character (\\ or \")")]
    ReservedCharacter(String),

    #[error("Profile name {0:?} is reserved by the profile file")]
    ReservedName(String),

    #[error("Profile already exists: {0}")]
    DuplicateName(String),

    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("TCP port {0} is reserved (must be 1024-65535)")]
    InvalidTcpPort(u16),

    #[error("{kind} profile requires {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("{kind} profile takes either {first} or {second}, not both")]
    ConflictingFields {
        kind: &'static str,
        first: &'static str,
        second: &'static str,
    },

    #[error("Serial port {0:?} must start with /dev/ or COM")]
    InvalidSerialPort(String),

    #[error("Shortcut number {0} is outside 1-9")]
    InvalidShortcut(u8),

    #[error("Shortcut number {shortcut} is already used by {owner}")]
    ShortcutInUse { shortcut: u8, owner: String },

    #[error("Connection delay {0}us is outside (0, 10000000]")]
    InvalidDelay(i64),

    #[error("At most 10 FOV circles are allowed, got {0}")]
    TooManyFovCircles(usize),

    #[error("FOV circle {0} must be a positive number of degrees")]
    InvalidFovCircle(f64),

    #[error("Interface not supported on this platform: {0}")]
    Unsupported(String),

    #[error("Connection already running: {0}")]
    AlreadyRunning(String),

    #[error("Connection {name} could not be started: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("Connection not running: {0}")]
    NotRunning(String),

    #[error("Profile {0} cannot be changed while its connection is running")]
    ProfileInUse(String),
}

/// Transport failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("No IPv4 address for {0}")]
    NoIpv4Address(String),

    #[error("Connection refused or failed: {0}")]
    ConnectFailed(String),

    #[error("Connection timed out after {0}ms")]
    ConnectTimeout(u64),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Failed to start driver {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Connection closed by peer")]
    Closed,

    #[error("Unsupported transport: {0}")]
    Unsupported(String),
}

impl LinkError {
    /// Whether reconnecting later could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LinkError::Unsupported(_) | LinkError::Spawn { .. })
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err.to_string())
    }
}

impl From<serialport::Error> for LinkError {
    fn from(err: serialport::Error) -> Self {
        LinkError::Serial(err.to_string())
    }
}

/// Corrupted or unexpected data on an established link
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Frame length {length} outside [4, {capacity}]")]
    FrameLength { length: usize, capacity: usize },

    #[error("Position frame too short: {0} bytes")]
    ShortPositionFrame(usize),

    #[error("Malformed answer: {0:?}")]
    MalformedAnswer(String),

    #[error("No answer within {0}ms")]
    AnswerTimeout(u64),

    #[error("Read buffer full ({0} bytes) without a complete frame")]
    ReadOverflow(usize),

    #[error("Message larger than the outgoing buffer")]
    OutboxOverflow,

    #[error("INDI: {0}")]
    Indi(#[from] IndiError),
}

/// Why a connection left the connected state
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Connection attempt timed out")]
    ConnectTimeout,

    #[error("No data received for {0}ms")]
    IdleTimeout(u64),

    #[error("Connection failed permanently: {0}")]
    Failed(String),
}

/// Profile persistence failure
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Profile file version {found:?} does not match {expected}")]
    VersionMismatch {
        found: Option<String>,
        expected: &'static str,
    },
}
