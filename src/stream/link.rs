use std::io::{Read, Write};
use std::time::Duration;

use tracing::info;

use super::StreamError;
use crate::config::MachineConfig;

/// How long a blocking read waits before the reader rechecks the session.
pub const READ_TICK: Duration = Duration::from_millis(100);

/// Both halves of a byte-stream connection to a controller. Reads must time
/// out with `TimedOut` or `WouldBlock` rather than block forever.
pub struct Link {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

impl Link {
    pub fn new(reader: impl Read + Send + 'static, writer: impl Write + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

pub fn open_serial(port: &str, config: &MachineConfig) -> Result<Link, StreamError> {
    let serial = serialport::new(port, config.baud_rate)
        .timeout(READ_TICK)
        .open()
        .map_err(|source| StreamError::Open {
            port: port.to_string(),
            source,
        })?;
    let reader = serial.try_clone().map_err(|source| StreamError::Open {
        port: port.to_string(),
        source,
    })?;
    info!(port, baud = config.baud_rate, "opened serial port");
    Ok(Link {
        reader: Box::new(reader),
        writer: Box::new(serial),
    })
}

pub fn available_ports() -> Result<Vec<String>, StreamError> {
    let ports = serialport::available_ports().map_err(StreamError::Ports)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
