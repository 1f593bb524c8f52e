// Command encoding.
//
// Cuts the axis tracks at every segment boundary of every axis, so within
// one slice each axis moves at exactly one rate. Each slice becomes one
// absolute `G1` carrying every moving axis, or a `G4` dwell when nothing
// moves. Adjacent dwells are merged.
//
// Targets are rounded to the precision written on the wire before the feed
// is derived, so the controller's own distance/feed arithmetic reproduces the
// slice duration. Every target is checked against the soft limits here.

use serde::{Deserialize, Serialize};

use super::CompileError;
use super::timeline::AxisTrack;
use crate::config::MachineConfig;
use crate::events::{MICROS_PER_MINUTE, MICROS_PER_SECOND, Micros};

const POSITION_SCALE: f64 = 10_000.0;

pub fn round_position(position: f64) -> f64 {
    (position * POSITION_SCALE).round() / POSITION_SCALE
}

/// One axis's share of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisMove {
    pub axis: char,
    /// The axis's own rate over this slice, mm/min.
    pub feed_rate: u32,
    /// Signed mm, as emitted.
    pub distance: f64,
    /// Absolute machine position at the end of the slice.
    pub target: f64,
}

/// One line of the compiled song.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionCommand {
    pub start: Micros,
    /// Expected execution time.
    pub duration: Micros,
    /// Vector feed for the whole line, mm/min. Zero for dwells.
    pub feed: f64,
    pub moves: Vec<AxisMove>,
}

impl MotionCommand {
    pub fn is_dwell(&self) -> bool {
        self.moves.is_empty()
    }

    /// The G-code line, without terminator.
    pub fn line(&self) -> String {
        if self.is_dwell() {
            return format!("G4 P{:.3}", self.duration as f64 / MICROS_PER_SECOND);
        }
        let mut line = String::from("G1");
        for m in &self.moves {
            line.push_str(&format!(" {}{:.4}", m.axis, m.target));
        }
        line.push_str(&format!(" F{:.3}", self.feed));
        line
    }
}

pub fn encode(tracks: &[AxisTrack], config: &MachineConfig) -> Result<Vec<MotionCommand>, CompileError> {
    let mut cuts: Vec<Micros> = tracks
        .iter()
        .flat_map(|track| track.segments.iter().flat_map(|s| [s.start, s.end()]))
        .collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut exact: Vec<f64> = config.axes.iter().map(|a| a.start).collect();
    let mut emitted: Vec<f64> = exact.iter().map(|&p| round_position(p)).collect();
    let mut cursor = vec![0usize; tracks.len()];
    let mut commands: Vec<MotionCommand> = Vec::new();

    for window in cuts.windows(2) {
        let (from, to) = (window[0], window[1]);
        let duration = to - from;
        let mut moves = Vec::new();

        for (t, track) in tracks.iter().enumerate() {
            while cursor[t] < track.segments.len() && track.segments[cursor[t]].end() <= from {
                cursor[t] += 1;
            }
            let Some(segment) = track.segments.get(cursor[t]) else {
                continue;
            };
            if segment.is_rest() || segment.start > from {
                continue;
            }

            let axis = track.axis;
            exact[axis] += segment.displacement_over(duration);
            let target = round_position(exact[axis]);
            let distance = target - emitted[axis];
            if distance == 0.0 {
                continue;
            }

            let limits = &config.axes[axis];
            if !limits.contains(target) {
                return Err(CompileError::SoftLimit {
                    command: commands.len(),
                    axis: limits.name,
                    target,
                    min: limits.min,
                    max: limits.max,
                });
            }

            emitted[axis] = target;
            moves.push(AxisMove {
                axis: limits.name,
                feed_rate: segment.feed_rate,
                distance,
                target,
            });
        }

        if moves.is_empty() {
            if let Some(last) = commands.last_mut().filter(|c| c.is_dwell()) {
                last.duration += duration;
                continue;
            }
            commands.push(MotionCommand {
                start: from,
                duration,
                feed: 0.0,
                moves,
            });
            continue;
        }

        let length = moves.iter().map(|m| m.distance * m.distance).sum::<f64>().sqrt();
        let feed = length / (duration as f64 / MICROS_PER_MINUTE);
        commands.push(MotionCommand {
            start: from,
            duration,
            feed,
            moves,
        });
    }

    Ok(commands)
}
