mod flow;
mod link;
mod protocol;
mod session;
mod virtual_grbl;

pub use flow::{FlowControl, Pending, Wait};
pub use link::{Link, READ_TICK, available_ports, open_serial};
pub use protocol::{LineReader, Response, StatusReport, WAKE_UP, parse_response, realtime};
pub use session::{
    AxisState, Canceller, SessionHandle, SessionOptions, SessionPhase, SessionUpdate, spawn_session,
};
pub use virtual_grbl::{Transcript, VirtualGrbl, VirtualGrblOptions};

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("song was compiled for axes {song} but the machine has {machine}")]
    AxisMismatch { song: String, machine: String },
    #[error(
        "command {command} would move axis '{axis}' to {target:.4} mm, outside its soft limits [{min}, {max}]"
    )]
    SoftLimit {
        command: usize,
        axis: char,
        target: f64,
        min: f64,
        max: f64,
    },
    #[error("line of {len} bytes (command {command:?}) does not fit the {capacity}-byte receive buffer")]
    LineTooLong {
        command: Option<usize>,
        len: usize,
        capacity: usize,
    },
    #[error("controller rejected `{line}` (command {command:?}): error:{code}")]
    Rejected {
        command: Option<usize>,
        line: String,
        code: u32,
    },
    #[error("controller raised ALARM:{0}")]
    Alarm(String),
    #[error("unexpected response from controller: {0:?}")]
    UnexpectedResponse(String),
    #[error("no acknowledgment for `{line}` (command {command:?}) within {waited:?}")]
    AckTimeout {
        command: Option<usize>,
        line: String,
        waited: Duration,
    },
    #[error("controller reset during the session")]
    ControllerReset,
    #[error("controller disconnected")]
    Disconnected,
    #[error("serial I/O failed: {0}")]
    Transport(#[from] std::io::Error),
    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        source: serialport::Error,
    },
    #[error("failed to list serial ports: {0}")]
    Ports(serialport::Error),
    #[error("session thread panicked")]
    Panicked,
}
