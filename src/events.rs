use serde::{Deserialize, Serialize};

/// Song time in microseconds from the first tick of the file.
pub type Micros = u64;

pub const MICROS_PER_SECOND: f64 = 1_000_000.0;
pub const MICROS_PER_MINUTE: f64 = 60_000_000.0;

/// Highest pitch a MIDI key can carry.
pub const MAX_PITCH: u8 = 127;

/// One sounding note as decoded from the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub pitch: u8,
    pub velocity: u8,
    pub channel: u8,
    pub start: Micros,
    pub duration: Micros,
}

impl NoteEvent {
    pub fn end(&self) -> Micros {
        self.start + self.duration
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteEdge {
    Off,
    On,
}

/// A note boundary in the merged timeline. `note` indexes the slice the
/// events were scheduled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedEvent {
    pub time: Micros,
    pub note: usize,
    pub edge: NoteEdge,
}
