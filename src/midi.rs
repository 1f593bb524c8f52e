// Standard MIDI File decoding.
//
// The file format itself is handled by `midly`; this module only turns its
// track events into `NoteEvent`s on an absolute microsecond timeline. Tempo
// changes from every track are merged into one tempo map, so format-1 files
// with a dedicated conductor track come out right.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use midly::{Format, MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::{Micros, NoteEvent};

/// MIDI default tempo: 120 BPM.
const DEFAULT_TEMPO_US_PER_QUARTER: u32 = 500_000;

#[derive(Debug, Error)]
pub enum MidiError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed MIDI file: {0}")]
    Parse(#[from] midly::Error),
    #[error("speed multiplier must be finite and positive, got {0}")]
    InvalidSpeed(f64),
}

pub fn decode_file(path: &Path, speed: f64) -> Result<Vec<NoteEvent>, MidiError> {
    let bytes = fs::read(path).map_err(|source| MidiError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    decode_bytes(&bytes, speed)
}

/// Decodes every note of every track. Times are divided by `speed`, so 2.0
/// plays twice as fast.
pub fn decode_bytes(bytes: &[u8], speed: f64) -> Result<Vec<NoteEvent>, MidiError> {
    if !(speed.is_finite() && speed > 0.0) {
        return Err(MidiError::InvalidSpeed(speed));
    }
    let smf = Smf::parse(bytes)?;

    let mut tempo_changes: Vec<(u64, u32)> = Vec::new();
    let mut raw_notes: Vec<RawNote> = Vec::new();
    let mut track_offset: u64 = 0;

    for (track_index, track) in smf.tracks.iter().enumerate() {
        let mut tick = track_offset;
        let mut open: HashMap<(u8, u8), VecDeque<(u64, u8)>> = HashMap::new();

        for event in track {
            tick += u64::from(event.delta.as_int());
            match event.kind {
                TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => {
                    tempo_changes.push((tick, tempo.as_int()));
                }
                TrackEventKind::Midi { channel, message } => {
                    let channel = channel.as_int();
                    match message {
                        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                            open.entry((channel, key.as_int()))
                                .or_default()
                                .push_back((tick, vel.as_int()));
                        }
                        MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                            let pitch = key.as_int();
                            if let Some((start, velocity)) = open
                                .get_mut(&(channel, pitch))
                                .and_then(VecDeque::pop_front)
                            {
                                raw_notes.push(RawNote {
                                    pitch,
                                    velocity,
                                    channel,
                                    start_tick: start,
                                    end_tick: tick,
                                });
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        let dangling: usize = open.values().map(VecDeque::len).sum();
        if dangling > 0 {
            warn!(track = track_index, count = dangling, "notes never released, dropping");
        }
        if smf.header.format == Format::Sequential {
            track_offset = tick;
        }
    }

    let tempo_map = TempoMap::new(smf.header.timing, tempo_changes);
    let scale = |tick: u64| -> Micros { (tempo_map.micros_at(tick) / speed).round() as Micros };

    let mut notes: Vec<NoteEvent> = raw_notes
        .into_iter()
        .filter_map(|raw| {
            let start = scale(raw.start_tick);
            let end = scale(raw.end_tick);
            if end <= start {
                return None;
            }
            Some(NoteEvent {
                pitch: raw.pitch,
                velocity: raw.velocity,
                channel: raw.channel,
                start,
                duration: end - start,
            })
        })
        .collect();

    notes.sort_by_key(|n| (n.start, n.channel, n.pitch));
    debug!(count = notes.len(), "decoded notes");
    Ok(notes)
}

struct RawNote {
    pitch: u8,
    velocity: u8,
    channel: u8,
    start_tick: u64,
    end_tick: u64,
}

/// Piecewise-constant tempo over ticks.
struct TempoMap {
    /// (tick, microseconds elapsed at that tick, us per quarter from there on)
    segments: Vec<(u64, f64, u32)>,
    ticks_per_quarter: f64,
    /// Fixed microseconds per tick for SMPTE timecode files.
    timecode_tick: Option<f64>,
}

impl TempoMap {
    fn new(timing: Timing, mut changes: Vec<(u64, u32)>) -> Self {
        let (ticks_per_quarter, timecode_tick) = match timing {
            Timing::Metrical(tpq) => (f64::from(tpq.as_int().max(1)), None),
            Timing::Timecode(fps, subframes) => {
                let ticks_per_second = f64::from(fps.as_f32()) * f64::from(subframes.max(1));
                (1.0, Some(1_000_000.0 / ticks_per_second))
            }
        };

        changes.sort_by_key(|&(tick, _)| tick);
        let mut segments = vec![(0u64, 0.0f64, DEFAULT_TEMPO_US_PER_QUARTER)];
        for (tick, tempo) in changes {
            let &(last_tick, last_us, last_tempo) = segments.last().unwrap_or(&(0, 0.0, 0));
            let elapsed = last_us + (tick - last_tick) as f64 * f64::from(last_tempo) / ticks_per_quarter;
            if tick == last_tick {
                segments.pop();
            }
            segments.push((tick, elapsed, tempo));
        }

        Self {
            segments,
            ticks_per_quarter,
            timecode_tick,
        }
    }

    fn micros_at(&self, tick: u64) -> f64 {
        if let Some(us_per_tick) = self.timecode_tick {
            return tick as f64 * us_per_tick;
        }
        let index = self.segments.partition_point(|&(start, _, _)| start <= tick);
        let (start, elapsed, tempo) = self.segments[index.saturating_sub(1)];
        elapsed + (tick - start) as f64 * f64::from(tempo) / self.ticks_per_quarter
    }
}
