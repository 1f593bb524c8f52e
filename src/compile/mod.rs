mod allocator;
mod encoder;
mod pitch;
mod timeline;

pub use allocator::{
    Allocation, AllocatorSettings, ChannelSetting, DropReason, DroppedNote, OverflowPolicy, Voice, allocate,
};
pub use encoder::{AxisMove, MotionCommand, encode, round_position};
pub use pitch::{FeedRate, OutOfRange, PitchMapper, RangePolicy, exact_feed_rate, note_frequency};
pub use timeline::{AxisTrack, MotionSegment, build_tracks, quantize_notes};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, MachineConfig};
use crate::events::{Micros, NoteEvent};
use crate::song::CompiledSong;
use crate::timing::{max_polyphony, normalize_notes, song_end, split_into_parts};

pub const MIDI_CHANNELS: usize = 16;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("nothing left to play: all {notes} notes were dropped")]
    Empty { notes: usize },
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
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub name: String,
    pub overflow: OverflowPolicy,
    pub range: RangePolicy,
    /// Per MIDI channel enable flag and priority.
    pub channels: Vec<ChannelSetting>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            name: "song".to_string(),
            overflow: OverflowPolicy::default(),
            range: RangePolicy::default(),
            channels: vec![ChannelSetting::default(); MIDI_CHANNELS],
        }
    }
}

/// What the compiler kept, changed and threw away.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileReport {
    pub notes: usize,
    pub zero_length: usize,
    pub merged: usize,
    pub muted: usize,
    pub out_of_range: usize,
    pub overflow: usize,
    pub preempted: usize,
    pub clamped: usize,
    pub max_polyphony: usize,
    pub commands: usize,
    pub duration: Micros,
}

impl CompileReport {
    pub fn dropped(&self) -> usize {
        self.zero_length + self.muted + self.out_of_range + self.overflow
    }
}

#[derive(Debug, Clone)]
pub struct Compiled {
    pub song: CompiledSong,
    pub report: CompileReport,
}

pub fn compile_song(
    notes: Vec<NoteEvent>,
    config: &MachineConfig,
    options: &CompileOptions,
) -> Result<Compiled, CompileError> {
    config.validate()?;

    let mut report = CompileReport {
        notes: notes.len(),
        ..CompileReport::default()
    };

    let (notes, zero_length) = quantize_notes(notes, config.min_segment());
    report.zero_length = zero_length;
    let before = notes.len();
    let notes = normalize_notes(notes);
    report.merged = before - notes.len();

    report.max_polyphony = max_polyphony(&notes);
    if report.max_polyphony > config.axis_count() {
        warn!(
            polyphony = report.max_polyphony,
            axes = config.axis_count(),
            policy = ?options.overflow,
            "song needs more axes than the machine has"
        );
    }

    let mapper = PitchMapper::new(config, options.range);
    let settings = AllocatorSettings {
        policy: options.overflow,
        settle: config.settle(),
        min_segment: config.min_segment(),
        channels: options.channels.clone(),
    };
    let allocation = allocate(&notes, &mapper, &settings);
    report.muted = allocation.dropped_for(DropReason::Muted);
    report.out_of_range = allocation.dropped_for(DropReason::OutOfRange);
    report.overflow = allocation.dropped_for(DropReason::Overflow);
    report.preempted = allocation.preempted;
    report.clamped = allocation.clamped;

    let end = allocation
        .axes
        .iter()
        .flatten()
        .map(|voice| voice.end)
        .max()
        .unwrap_or(0)
        .max(song_end(&notes));
    if allocation.axes.iter().all(Vec::is_empty) {
        return Err(CompileError::Empty { notes: report.notes });
    }

    let tracks = build_tracks(&allocation, config, end);
    let commands = encode(&tracks, config)?;
    report.commands = commands.len();
    report.duration = end;

    info!(
        name = %options.name,
        notes = report.notes,
        dropped = report.dropped(),
        commands = report.commands,
        duration_s = end as f64 / crate::events::MICROS_PER_SECOND,
        "compiled song"
    );

    Ok(Compiled {
        song: CompiledSong::new(&options.name, config, end, commands),
        report,
    })
}

/// Splits the song into parts that each fit the machine's axes and compiles
/// every part on its own, named `<name>_<n>`.
pub fn compile_parts(
    notes: Vec<NoteEvent>,
    config: &MachineConfig,
    options: &CompileOptions,
) -> Result<Vec<Compiled>, CompileError> {
    config.validate()?;
    let (notes, _) = quantize_notes(notes, config.min_segment());
    let parts = split_into_parts(&normalize_notes(notes), config.axis_count());
    info!(parts = parts.len(), "split song into parts");

    parts
        .into_iter()
        .enumerate()
        .map(|(index, part)| {
            let options = CompileOptions {
                name: format!("{}_{}", options.name, index + 1),
                ..options.clone()
            };
            compile_song(part, config, &options)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AxisConfig;

    fn config() -> MachineConfig {
        MachineConfig::with_axes(vec![
            AxisConfig::new('X', 26.667, 50.0, 150.0),
            AxisConfig::new('Y', 26.667, 50.0, 150.0),
        ])
    }

    fn note(pitch: u8, velocity: u8, start_ms: u64, end_ms: u64) -> NoteEvent {
        NoteEvent {
            pitch,
            velocity,
            channel: 0,
            start: start_ms * 1_000,
            duration: (end_ms - start_ms) * 1_000,
        }
    }

    /// Number of axes moving at `time` according to the emitted commands.
    fn moving_axes_at(song: &CompiledSong, time: Micros) -> usize {
        song.commands
            .iter()
            .find(|c| c.start <= time && time < c.start + c.duration)
            .map_or(0, |c| c.moves.len())
    }

    #[test]
    fn two_notes_on_two_axes() {
        let notes = vec![note(60, 100, 0, 500), note(72, 100, 200, 700)];
        let compiled = compile_song(notes, &config(), &CompileOptions::default()).unwrap();
        let song = &compiled.song;

        assert_eq!(compiled.report.dropped(), 0);
        assert_eq!(compiled.report.preempted, 0);
        assert_eq!(song.duration, 700_000);

        // Slices: [0,200) X only, [200,500) X and Y, [500,700) Y only.
        assert_eq!(song.commands.len(), 3);
        let axes: Vec<Vec<char>> = song
            .commands
            .iter()
            .map(|c| c.moves.iter().map(|m| m.axis).collect())
            .collect();
        assert_eq!(axes, vec![vec!['X'], vec!['X', 'Y'], vec!['Y']]);

        let c4 = PitchMapper::new(&config(), RangePolicy::Drop).feed_rate(0, 60).unwrap().rate;
        let c5 = PitchMapper::new(&config(), RangePolicy::Drop).feed_rate(1, 72).unwrap().rate;
        assert_eq!(song.commands[0].moves[0].feed_rate, c4);
        assert_eq!(song.commands[1].moves[0].feed_rate, c4);
        assert_eq!(song.commands[1].moves[1].feed_rate, c5);
        assert_eq!(song.commands[2].moves[0].feed_rate, c5);
    }

    #[test]
    fn overflow_drops_exactly_one_note() {
        let notes = vec![
            note(60, 100, 0, 1000),
            note(64, 40, 100, 1000),
            note(67, 90, 200, 1000),
        ];
        let compiled = compile_song(notes, &config(), &CompileOptions::default()).unwrap();
        assert_eq!(compiled.report.overflow, 1);
        assert_eq!(compiled.report.dropped(), 1);
        assert_eq!(compiled.report.max_polyphony, 3);
    }

    #[test]
    fn moving_axes_never_exceed_axis_count() {
        let notes: Vec<NoteEvent> = (0..24)
            .map(|i| note(50 + (i % 20) as u8, 20 + (i * 13 % 100) as u8, i * 60, i * 60 + 350))
            .collect();
        let config = config();
        for overflow in [
            OverflowPolicy::DropLowestPriority,
            OverflowPolicy::DropNewest,
            OverflowPolicy::PreemptLowestPriority,
        ] {
            let options = CompileOptions {
                overflow,
                ..CompileOptions::default()
            };
            let compiled = compile_song(notes.clone(), &config, &options).unwrap();
            let song = &compiled.song;
            for command in &song.commands {
                assert!(command.moves.len() <= config.axis_count());
                assert!(moving_axes_at(song, command.start) <= config.axis_count());
                for m in &command.moves {
                    let axis = config.axes.iter().find(|a| a.name == m.axis).unwrap();
                    assert!(axis.contains(m.target));
                }
            }
        }
    }

    #[test]
    fn muted_song_has_nothing_to_play() {
        let mut options = CompileOptions::default();
        options.channels[0].enabled = false;
        let err = compile_song(vec![note(60, 100, 0, 500)], &config(), &options).unwrap_err();
        assert!(matches!(err, CompileError::Empty { notes: 1 }));
    }

    #[test]
    fn parts_fit_the_machine() {
        let notes = vec![
            note(60, 100, 0, 1000),
            note(64, 100, 0, 1000),
            note(67, 100, 0, 1000),
        ];
        let options = CompileOptions {
            name: "chord".to_string(),
            ..CompileOptions::default()
        };
        let parts = compile_parts(notes, &config(), &options).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].song.name, "chord_1");
        assert_eq!(parts[1].song.name, "chord_2");
        assert!(parts.iter().all(|p| p.report.overflow == 0));
    }
}
