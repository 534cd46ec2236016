//! Serial port link for hand controllers

use super::Link;
use crate::error::LinkError;
use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

pub struct SerialLink {
    path: String,
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Open the port synchronously (8N1, no flow control)
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, LinkError> {
        let port = serialport::new(path, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::ZERO)
            .open()?;
        tracing::info!("Opened serial port {} at {} baud", path, baud_rate);
        Ok(Self {
            path: path.to_string(),
            port,
        })
    }
}

fn would_block(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

impl Link for SerialLink {
    fn poll_established(&mut self) -> Result<bool, LinkError> {
        Ok(true)
    }

    fn read_available(&mut self, buf: &mut Vec<u8>, limit: usize) -> Result<usize, LinkError> {
        let available = self.port.bytes_to_read()? as usize;
        let n = available.min(limit);
        if n == 0 {
            return Ok(0);
        }
        let mut chunk = vec![0u8; n];
        match self.port.read(&mut chunk) {
            Ok(read) => {
                buf.extend_from_slice(&chunk[..read]);
                Ok(read)
            }
            Err(e) if would_block(e.kind()) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, LinkError> {
        match self.port.write(data) {
            Ok(n) => Ok(n),
            Err(e) if would_block(e.kind()) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        self.path.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_port_fails() {
        let result = SerialLink::open("/dev/scopelink-does-not-exist", 9600);
        assert!(matches!(result, Err(LinkError::Serial(_))));
    }

    #[test]
    fn test_timeouts_count_as_no_progress() {
        assert!(would_block(ErrorKind::TimedOut));
        assert!(would_block(ErrorKind::WouldBlock));
        assert!(!would_block(ErrorKind::BrokenPipe));
    }
}
