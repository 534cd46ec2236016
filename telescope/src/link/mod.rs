//! Byte transports
//!
//! A [`Link`] is polled from the update thread and never blocks. Network and
//! process links run their I/O on tokio tasks and hand over owned byte
//! chunks through bounded channels; serial links are read directly with
//! whatever the driver already has buffered.

mod channel;
mod process;
mod serial;
mod tcp;

pub use channel::ChannelLink;
pub use process::spawn_driver;
pub use serial::SerialLink;
pub use tcp::{connect_tcp, resolve_ipv4};

use crate::error::LinkError;
use std::time::Duration;
use tokio::runtime::Handle;

pub trait Link: Send {
    /// `Ok(true)` once the link carries data, `Ok(false)` while still opening
    fn poll_established(&mut self) -> Result<bool, LinkError>;

    /// Append at most `limit` already-received bytes to `buf`.
    ///
    /// `Err(LinkError::Closed)` reports end of stream once everything before
    /// it has been delivered.
    fn read_available(&mut self, buf: &mut Vec<u8>, limit: usize) -> Result<usize, LinkError>;

    /// Hand over as much of `data` as can be taken without blocking
    fn write(&mut self, data: &[u8]) -> Result<usize, LinkError>;

    /// Human readable endpoint for logs
    fn describe(&self) -> String;
}

/// Where a connection's bytes go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp { host: String, port: u16 },
    Serial { path: String, baud_rate: u32 },
    /// A local driver speaking on its stdio
    Process { program: String, args: Vec<String> },
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Transport::Serial { path, baud_rate } => write!(f, "{} @ {} baud", path, baud_rate),
            Transport::Process { program, .. } => write!(f, "driver {}", program),
        }
    }
}

/// Opens links; swapped out in tests
pub trait Connector: Send + Sync {
    fn open(&self, transport: &Transport, connect_timeout: Duration) -> Result<Box<dyn Link>, LinkError>;
}

/// Opens real links, running their I/O on the given runtime
#[derive(Debug, Clone)]
pub struct RuntimeConnector {
    handle: Handle,
}

impl RuntimeConnector {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Connector for RuntimeConnector {
    fn open(&self, transport: &Transport, connect_timeout: Duration) -> Result<Box<dyn Link>, LinkError> {
        match transport {
            Transport::Tcp { host, port } => {
                Ok(Box::new(connect_tcp(&self.handle, host, *port, connect_timeout)?))
            }
            Transport::Serial { path, baud_rate } => Ok(Box::new(SerialLink::open(path, *baud_rate)?)),
            Transport::Process { program, args } => {
                Ok(Box::new(spawn_driver(&self.handle, program, args)?))
            }
        }
    }
}
