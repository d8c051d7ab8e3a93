//! Byte-stream transport to the controller UART.
//!
//! The framer is the only owner of a [`ByteStream`]; nothing else reads or
//! writes the device once a session is open.

use std::io::{Read, Write};
use std::time::Duration;

use log::{debug, info};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::errors::{LinkError, Result};

/// Baud rates the controller UART can be switched to.
pub const SUPPORTED_BAUD_RATES: [u32; 9] = [
    9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600, 1_500_000,
];

/// Short poll interval used for reads so deadlines and cancellation are observed.
pub const READ_POLL: Duration = Duration::from_millis(20);

pub fn is_supported_baud(baud: u32) -> bool {
    SUPPORTED_BAUD_RATES.contains(&baud)
}

/// Raw, blocking byte I/O with a reconfigurable line speed.
///
/// Reads return `ErrorKind::TimedOut` (or `WouldBlock`) after the configured
/// poll timeout when no data is available.
pub trait ByteStream: Read + Write + Send {
    fn baud_rate(&self) -> u32;

    fn set_baud_rate(&mut self, baud: u32) -> Result<()>;

    /// Drop anything buffered in either direction.
    fn discard_buffers(&mut self) -> Result<()>;
}

/// A UART opened raw, no echo, 8-N-1, no flow control.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    path: String,
}

impl SerialTransport {
    /// Open `path` at `baud`.
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        if !is_supported_baud(baud) {
            return Err(LinkError::UnsupportedBaud(baud));
        }

        let port = open_port(path, baud)?;
        let mut transport = Self {
            port,
            path: path.to_string(),
        };
        transport.discard_buffers()?;
        info!("opened {} at {} baud", path, baud);
        Ok(transport)
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(unix)]
fn open_port(path: &str, baud: u32) -> Result<Box<dyn SerialPort>> {
    let mut port = serialport::new(path, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_POLL)
        .open_native()?;
    port.set_exclusive(true)?;
    Ok(Box::new(port))
}

#[cfg(not(unix))]
fn open_port(path: &str, baud: u32) -> Result<Box<dyn SerialPort>> {
    Ok(serialport::new(path, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(READ_POLL)
        .open()?)
}

impl ByteStream for SerialTransport {
    fn baud_rate(&self) -> u32 {
        self.port.baud_rate().unwrap_or_default()
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        if !is_supported_baud(baud) {
            return Err(LinkError::UnsupportedBaud(baud));
        }
        self.port.set_baud_rate(baud)?;
        debug!("{}: line speed now {} baud", self.path, baud);
        Ok(())
    }

    fn discard_buffers(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_baud_before_opening() {
        match SerialTransport::open("/dev/does-not-exist", 12345) {
            Err(LinkError::UnsupportedBaud(12345)) => {}
            other => panic!("unexpected result: {:?}", other.map(|t| t.path().to_string())),
        }
    }

    #[test]
    fn missing_device_is_an_error() {
        assert!(SerialTransport::open("/dev/does-not-exist", 115200).is_err());
    }

    #[test]
    fn high_speed_target_is_supported() {
        assert!(is_supported_baud(115200));
        assert!(is_supported_baud(1_500_000));
        assert!(!is_supported_baud(3_000_000));
    }
}
