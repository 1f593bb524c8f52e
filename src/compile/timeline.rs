// Per-axis motion timeline.
//
// Turns the allocator's voices into gapless tracks of motion segments. Each
// axis starts at its configured start position; a note moves it at the note's
// feed rate, successive notes alternate direction so the axis swings around
// its start instead of creeping toward one end. When a single note would
// carry the axis past a travel limit, the segment is folded: it runs to the
// limit and continues in the opposite direction.

use tracing::{debug, info};

use super::allocator::Allocation;
use crate::config::{AxisConfig, MachineConfig};
use crate::events::{MICROS_PER_MINUTE, Micros, NoteEvent};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSegment {
    pub axis: usize,
    pub start: Micros,
    pub duration: Micros,
    /// mm/min; zero for a rest.
    pub feed_rate: u32,
    /// Signed displacement in mm.
    pub distance: f64,
}

impl MotionSegment {
    pub fn end(&self) -> Micros {
        self.start + self.duration
    }

    pub fn is_rest(&self) -> bool {
        self.feed_rate == 0
    }

    /// Signed mm travelled over `duration` microseconds of this segment.
    pub fn displacement_over(&self, duration: Micros) -> f64 {
        if self.is_rest() || self.duration == 0 {
            return 0.0;
        }
        self.distance * duration as f64 / self.duration as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AxisTrack {
    pub axis: usize,
    pub segments: Vec<MotionSegment>,
}

impl AxisTrack {
    pub fn end(&self) -> Micros {
        self.segments.last().map_or(0, MotionSegment::end)
    }
}

/// Stretches notes shorter than `min_segment` and discards empty ones.
/// Returns the kept notes and how many were discarded.
pub fn quantize_notes(notes: Vec<NoteEvent>, min_segment: Micros) -> (Vec<NoteEvent>, usize) {
    let mut kept = Vec::with_capacity(notes.len());
    let mut discarded = 0;

    for mut note in notes {
        if note.duration == 0 {
            info!(pitch = note.pitch, start_us = note.start, "dropping zero-length note");
            discarded += 1;
            continue;
        }
        if note.duration < min_segment {
            debug!(
                pitch = note.pitch,
                duration_us = note.duration,
                min_segment_us = min_segment,
                "stretching short note"
            );
            note.duration = min_segment;
        }
        kept.push(note);
    }

    (kept, discarded)
}

fn mm_per_micro(feed_rate: u32) -> f64 {
    f64::from(feed_rate) / MICROS_PER_MINUTE
}

pub fn build_tracks(allocation: &Allocation, config: &MachineConfig, song_end: Micros) -> Vec<AxisTrack> {
    allocation
        .axes
        .iter()
        .enumerate()
        .map(|(axis, voices)| {
            let mut builder = TrackBuilder::new(axis, &config.axes[axis]);
            for voice in voices {
                builder.rest_until(voice.start);
                builder.sound(voice.start, voice.end, voice.feed_rate);
            }
            builder.rest_until(song_end);
            builder.finish()
        })
        .collect()
}

struct TrackBuilder<'a> {
    axis: usize,
    limits: &'a AxisConfig,
    position: f64,
    direction: f64,
    cursor: Micros,
    segments: Vec<MotionSegment>,
}

impl<'a> TrackBuilder<'a> {
    fn new(axis: usize, limits: &'a AxisConfig) -> Self {
        Self {
            axis,
            limits,
            position: limits.start,
            direction: 1.0,
            cursor: 0,
            segments: Vec::new(),
        }
    }

    fn push(&mut self, duration: Micros, feed_rate: u32, distance: f64) {
        self.segments.push(MotionSegment {
            axis: self.axis,
            start: self.cursor,
            duration,
            feed_rate,
            distance,
        });
        self.cursor += duration;
        self.position += distance;
    }

    fn rest_until(&mut self, time: Micros) {
        if time > self.cursor {
            self.push(time - self.cursor, 0, 0.0);
        }
    }

    fn sound(&mut self, start: Micros, end: Micros, feed_rate: u32) {
        debug_assert!(start >= self.cursor);
        self.rest_until(start);

        let speed = mm_per_micro(feed_rate);
        let mut remaining = end - start;
        let mut stalled_folds = 0;

        while remaining > 0 {
            let target = self.position + self.direction * speed * remaining as f64;
            if self.limits.contains(target) || stalled_folds > 1 {
                self.push(remaining, feed_rate, target - self.position);
                break;
            }

            let limit = if self.direction > 0.0 {
                self.limits.max
            } else {
                self.limits.min
            };
            let room = (limit - self.position).abs();
            let run = ((room / speed).floor() as Micros).min(remaining);
            if run == 0 {
                stalled_folds += 1;
            } else {
                stalled_folds = 0;
                self.push(run, feed_rate, self.direction * speed * run as f64);
                remaining -= run;
                debug!(axis = self.axis, at_us = self.cursor, "folding note at travel limit");
            }
            self.direction = -self.direction;
        }

        self.direction = -self.direction;
    }

    fn finish(self) -> AxisTrack {
        AxisTrack {
            axis: self.axis,
            segments: self.segments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::allocator::Voice;

    fn config() -> MachineConfig {
        MachineConfig::with_axes(vec![
            AxisConfig::new('X', 26.667, 50.0, 150.0),
            AxisConfig::new('Y', 26.667, 50.0, 150.0),
        ])
    }

    fn voice(feed_rate: u32, start_ms: u64, end_ms: u64) -> Voice {
        Voice {
            note: 0,
            pitch: 60,
            feed_rate,
            start: start_ms * 1_000,
            end: end_ms * 1_000,
        }
    }

    fn assert_gapless(track: &AxisTrack, song_end: Micros) {
        let mut cursor = 0;
        for segment in &track.segments {
            assert_eq!(segment.start, cursor);
            assert!(segment.duration > 0);
            cursor = segment.end();
        }
        assert_eq!(cursor, song_end);
    }

    #[test]
    fn rests_fill_gaps_and_directions_alternate() {
        let allocation = Allocation {
            axes: vec![vec![voice(600, 100, 300), voice(600, 400, 600)], vec![]],
            ..Allocation::default()
        };
        let tracks = build_tracks(&allocation, &config(), 1_000_000);

        assert_gapless(&tracks[0], 1_000_000);
        assert_gapless(&tracks[1], 1_000_000);

        let x = &tracks[0].segments;
        assert_eq!(x.len(), 5);
        assert!(x[0].is_rest());
        // 600 mm/min for 200 ms is 2 mm.
        assert!((x[1].distance - 2.0).abs() < 1e-9);
        assert!(x[2].is_rest());
        assert!((x[3].distance + 2.0).abs() < 1e-9);
        assert!(x[4].is_rest());

        assert_eq!(tracks[1].segments.len(), 1);
        assert!(tracks[1].segments[0].is_rest());
    }

    #[test]
    fn long_note_folds_inside_window() {
        // 6000 mm/min for 2 s is 200 mm, twice the 100 mm window.
        let allocation = Allocation {
            axes: vec![vec![voice(6_000, 0, 2_000)], vec![]],
            ..Allocation::default()
        };
        let config = config();
        let tracks = build_tracks(&allocation, &config, 2_000_000);
        let x = &tracks[0];

        assert_gapless(x, 2_000_000);
        assert!(x.segments.len() > 1);

        let mut position = config.axes[0].start;
        for segment in &x.segments {
            assert_eq!(segment.feed_rate, 6_000);
            position += segment.distance;
            assert!(config.axes[0].contains(position), "left window at {position}");
        }
    }

    #[test]
    fn quantize_stretches_and_discards() {
        let note = |duration| NoteEvent {
            pitch: 60,
            velocity: 100,
            channel: 0,
            start: 0,
            duration,
        };
        let (kept, discarded) = quantize_notes(vec![note(0), note(5_000), note(50_000)], 20_000);
        assert_eq!(discarded, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].duration, 20_000);
        assert_eq!(kept[1].duration, 50_000);
    }
}
