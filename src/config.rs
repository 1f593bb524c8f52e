use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::events::Micros;

/// Axis letters the controller understands, in the order it reports them.
pub const AXIS_NAMES: [char; 6] = ['X', 'Y', 'Z', 'A', 'B', 'C'];

/// Lowest allowed `min_feed_rate`. From 1/(2^(1/12) - 1), about 16.82 mm/min,
/// upward, adjacent semitones are more than 1 mm/min apart.
pub const MIN_DISTINCT_FEED_RATE: u32 = 17;

const MIN_RX_BUFFER: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read machine config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed machine config: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("machine must have between 1 and 6 axes, got {0}")]
    AxisCount(usize),
    #[error("unknown axis name '{0}'")]
    UnknownAxis(char),
    #[error("axis '{0}' is configured twice")]
    DuplicateAxis(char),
    #[error("axis '{axis}': steps_per_mm must be positive, got {value}")]
    InvalidSteps { axis: char, value: f64 },
    #[error("axis '{axis}': soft limits [{min}, {max}] are not a valid window")]
    InvalidWindow { axis: char, min: f64, max: f64 },
    #[error("axis '{axis}': start {start} lies outside [{min}, {max}]")]
    StartOutsideWindow {
        axis: char,
        start: f64,
        min: f64,
        max: f64,
    },
    #[error("axis '{axis}': home position {value} is not finite")]
    InvalidHome { axis: char, value: f64 },
    #[error("axis '{axis}': feed range [{min}, {max}] invalid (min must be >= 17 and below max)")]
    InvalidFeedRange { axis: char, min: u32, max: u32 },
    #[error("rx_buffer_size {0} is below the minimum of 16 bytes")]
    BufferTooSmall(usize),
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    pub name: char,
    pub steps_per_mm: f64,
    /// Soft-limit window in machine millimetres.
    pub min: f64,
    pub max: f64,
    /// Where the axis parks before the first note.
    pub start: f64,
    /// Machine position reported right after a homing cycle.
    #[serde(default)]
    pub home: f64,
    #[serde(default = "default_min_feed_rate")]
    pub min_feed_rate: u32,
    #[serde(default = "default_max_feed_rate")]
    pub max_feed_rate: u32,
}

impl AxisConfig {
    /// An axis centred in its window, with default feed limits.
    pub fn new(name: char, steps_per_mm: f64, min: f64, max: f64) -> Self {
        Self {
            name,
            steps_per_mm,
            min,
            max,
            start: (min + max) / 2.0,
            home: 0.0,
            min_feed_rate: default_min_feed_rate(),
            max_feed_rate: default_max_feed_rate(),
        }
    }

    pub fn contains(&self, position: f64) -> bool {
        const EPSILON: f64 = 1e-6;
        position >= self.min - EPSILON && position <= self.max + EPSILON
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let axis = self.name;
        if !AXIS_NAMES.contains(&axis) {
            return Err(ConfigError::UnknownAxis(axis));
        }
        if !(self.steps_per_mm.is_finite() && self.steps_per_mm > 0.0) {
            return Err(ConfigError::InvalidSteps {
                axis,
                value: self.steps_per_mm,
            });
        }
        if !(self.min.is_finite() && self.max.is_finite() && self.min < self.max) {
            return Err(ConfigError::InvalidWindow {
                axis,
                min: self.min,
                max: self.max,
            });
        }
        if !(self.start.is_finite() && self.start >= self.min && self.start <= self.max) {
            return Err(ConfigError::StartOutsideWindow {
                axis,
                start: self.start,
                min: self.min,
                max: self.max,
            });
        }
        if !self.home.is_finite() {
            return Err(ConfigError::InvalidHome {
                axis,
                value: self.home,
            });
        }
        if self.min_feed_rate < MIN_DISTINCT_FEED_RATE || self.min_feed_rate >= self.max_feed_rate
        {
            return Err(ConfigError::InvalidFeedRange {
                axis,
                min: self.min_feed_rate,
                max: self.max_feed_rate,
            });
        }
        Ok(())
    }
}

/// Everything the compiler and the streaming runtime need to know about one
/// machine. Stored as RON next to the songs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Serial device used when none is given on the command line.
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    pub axes: Vec<AxisConfig>,
    /// Controller serial receive buffer, in bytes.
    #[serde(default = "default_rx_buffer_size")]
    pub rx_buffer_size: usize,
    /// Time an axis needs after a note before it can take a new rate.
    #[serde(default)]
    pub settle_ms: u64,
    /// Shortest segment the controller can execute reliably.
    #[serde(default = "default_min_segment_ms")]
    pub min_segment_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_homing_timeout_ms")]
    pub homing_timeout_ms: u64,
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_true")]
    pub home_on_connect: bool,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_rx_buffer_size() -> usize {
    128
}

fn default_min_segment_ms() -> u64 {
    20
}

fn default_ack_timeout_ms() -> u64 {
    5_000
}

fn default_homing_timeout_ms() -> u64 {
    60_000
}

fn default_status_interval_ms() -> u64 {
    250
}

fn default_startup_delay_ms() -> u64 {
    2_000
}

fn default_min_feed_rate() -> u32 {
    30
}

fn default_max_feed_rate() -> u32 {
    8_000
}

fn default_true() -> bool {
    true
}

impl MachineConfig {
    /// A config with the given axes and every other field at its default.
    pub fn with_axes(axes: Vec<AxisConfig>) -> Self {
        Self {
            port: None,
            baud_rate: default_baud_rate(),
            axes,
            rx_buffer_size: default_rx_buffer_size(),
            settle_ms: 0,
            min_segment_ms: default_min_segment_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            homing_timeout_ms: default_homing_timeout_ms(),
            status_interval_ms: default_status_interval_ms(),
            startup_delay_ms: default_startup_delay_ms(),
            home_on_connect: true,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron_str(&text)
    }

    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: MachineConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.axes.is_empty() || self.axes.len() > AXIS_NAMES.len() {
            return Err(ConfigError::AxisCount(self.axes.len()));
        }
        for (i, axis) in self.axes.iter().enumerate() {
            axis.validate()?;
            if self.axes[..i].iter().any(|other| other.name == axis.name) {
                return Err(ConfigError::DuplicateAxis(axis.name));
            }
        }
        if self.rx_buffer_size < MIN_RX_BUFFER {
            return Err(ConfigError::BufferTooSmall(self.rx_buffer_size));
        }
        let required = [
            ("baud_rate", u64::from(self.baud_rate)),
            ("min_segment_ms", self.min_segment_ms),
            ("ack_timeout_ms", self.ack_timeout_ms),
            ("homing_timeout_ms", self.homing_timeout_ms),
            ("status_interval_ms", self.status_interval_ms),
        ];
        for (name, value) in required {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }

    pub fn axis_count(&self) -> usize {
        self.axes.len()
    }

    pub fn settle(&self) -> Micros {
        self.settle_ms * 1_000
    }

    pub fn min_segment(&self) -> Micros {
        self.min_segment_ms * 1_000
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn homing_timeout(&self) -> Duration {
        Duration::from_millis(self.homing_timeout_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}
