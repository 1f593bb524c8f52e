use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::MachineConfig;

/// A4, the tuning reference.
pub const CONCERT_PITCH_HZ: f64 = 440.0;
pub const CONCERT_PITCH_KEY: u8 = 69;

/// What to do with a note whose feed rate falls outside an axis's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RangePolicy {
    #[default]
    Drop,
    Clamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum OutOfRange {
    #[error("pitch {pitch} needs {rate:.1} mm/min on axis '{axis}', below the {min} mm/min floor")]
    TooLow {
        pitch: u8,
        axis: char,
        rate: f64,
        min: u32,
    },
    #[error("pitch {pitch} needs {rate:.1} mm/min on axis '{axis}', above the {max} mm/min ceiling")]
    TooHigh {
        pitch: u8,
        axis: char,
        rate: f64,
        max: u32,
    },
}

/// A mapped rate. `clamped` is set when the policy pulled it into range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedRate {
    pub rate: u32,
    pub clamped: bool,
}

/// Equal-tempered fundamental of a MIDI key.
pub fn note_frequency(pitch: u8) -> f64 {
    CONCERT_PITCH_HZ * 2.0_f64.powf((f64::from(pitch) - f64::from(CONCERT_PITCH_KEY)) / 12.0)
}

/// Feed in mm/min at which an axis emits `frequency` step pulses per second.
pub fn exact_feed_rate(frequency: f64, steps_per_mm: f64) -> f64 {
    frequency / steps_per_mm * 60.0
}

#[derive(Debug, Clone)]
struct AxisRates {
    name: char,
    steps_per_mm: f64,
    min: u32,
    max: u32,
}

#[derive(Debug, Clone)]
pub struct PitchMapper {
    axes: Vec<AxisRates>,
    policy: RangePolicy,
}

impl PitchMapper {
    pub fn new(config: &MachineConfig, policy: RangePolicy) -> Self {
        let axes = config
            .axes
            .iter()
            .map(|axis| AxisRates {
                name: axis.name,
                steps_per_mm: axis.steps_per_mm,
                min: axis.min_feed_rate,
                max: axis.max_feed_rate,
            })
            .collect();
        Self { axes, policy }
    }

    pub fn axis_count(&self) -> usize {
        self.axes.len()
    }

    pub fn policy(&self) -> RangePolicy {
        self.policy
    }

    /// Feed rate for `pitch` on axis index `axis`, rounded to whole mm/min.
    ///
    /// The range check uses the exact rate. Above the validated floor two
    /// adjacent semitones are more than 1 mm/min apart, so their rounded
    /// rates still differ.
    pub fn feed_rate(&self, axis: usize, pitch: u8) -> Result<FeedRate, OutOfRange> {
        let rates = &self.axes[axis];
        let exact = exact_feed_rate(note_frequency(pitch), rates.steps_per_mm);

        if exact < f64::from(rates.min) {
            return match self.policy {
                RangePolicy::Clamp => Ok(FeedRate {
                    rate: rates.min,
                    clamped: true,
                }),
                RangePolicy::Drop => Err(OutOfRange::TooLow {
                    pitch,
                    axis: rates.name,
                    rate: exact,
                    min: rates.min,
                }),
            };
        }
        if exact > f64::from(rates.max) {
            return match self.policy {
                RangePolicy::Clamp => Ok(FeedRate {
                    rate: rates.max,
                    clamped: true,
                }),
                RangePolicy::Drop => Err(OutOfRange::TooHigh {
                    pitch,
                    axis: rates.name,
                    rate: exact,
                    max: rates.max,
                }),
            };
        }

        Ok(FeedRate {
            rate: exact.round() as u32,
            clamped: false,
        })
    }

    /// Lowest and highest pitch an axis can play without clamping.
    pub fn supported_range(&self, axis: usize) -> Option<(u8, u8)> {
        let strict = Self {
            axes: vec![self.axes[axis].clone()],
            policy: RangePolicy::Drop,
        };
        let mut playable = (0..=crate::events::MAX_PITCH).filter(|&p| strict.feed_rate(0, p).is_ok());
        let low = playable.next()?;
        let high = playable.last().unwrap_or(low);
        Some((low, high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AxisConfig, MIN_DISTINCT_FEED_RATE};

    fn mapper(policy: RangePolicy) -> PitchMapper {
        let config = MachineConfig::with_axes(vec![
            AxisConfig::new('X', 26.667, 50.0, 150.0),
            AxisConfig::new('Y', 80.0, 50.0, 150.0),
        ]);
        PitchMapper::new(&config, policy)
    }

    #[test]
    fn concert_pitch_anchor() {
        assert!((note_frequency(69) - 440.0).abs() < 1e-9);
        assert!((note_frequency(81) - 880.0).abs() < 1e-9);
        assert!((note_frequency(60) - 261.6256).abs() < 1e-3);
    }

    #[test]
    fn a4_on_reference_machine() {
        // 440 Hz at 26.667 steps/mm is 16.5 mm/s.
        let rate = mapper(RangePolicy::Drop).feed_rate(0, 69).unwrap();
        assert_eq!(rate.rate, 990);
        assert!(!rate.clamped);
    }

    #[test]
    fn strictly_increasing_over_supported_range() {
        let mapper = mapper(RangePolicy::Drop);
        for axis in 0..mapper.axis_count() {
            let (low, high) = mapper.supported_range(axis).unwrap();
            assert!(low < high);
            let mut previous = 0;
            for pitch in low..=high {
                let rate = mapper.feed_rate(axis, pitch).unwrap().rate;
                assert!(rate > previous, "axis {axis} pitch {pitch}: {rate} <= {previous}");
                previous = rate;
            }
        }
    }

    #[test]
    fn lowest_allowed_floor_keeps_semitones_distinct() {
        // A4 lands at 16.5 mm/min, which would round up onto the floor.
        let mut axis = AxisConfig::new('X', 1599.5153, 0.0, 100.0);
        axis.min_feed_rate = MIN_DISTINCT_FEED_RATE;
        let config = MachineConfig::with_axes(vec![axis]);
        config.validate().unwrap();

        let mapper = PitchMapper::new(&config, RangePolicy::Drop);
        assert!(matches!(mapper.feed_rate(0, 69), Err(OutOfRange::TooLow { .. })));
        assert_eq!(mapper.supported_range(0), Some((70, 127)));
        assert_eq!(mapper.feed_rate(0, 70).unwrap().rate, 17);
        assert_eq!(mapper.feed_rate(0, 71).unwrap().rate, 19);

        let mut previous = 0;
        for pitch in 70..=127 {
            let rate = mapper.feed_rate(0, pitch).unwrap().rate;
            assert!(rate > previous, "pitch {pitch}: {rate} <= {previous}");
            previous = rate;
        }
    }

    #[test]
    fn out_of_range_drops_or_clamps() {
        let dropping = mapper(RangePolicy::Drop);
        assert!(matches!(
            dropping.feed_rate(0, 0),
            Err(OutOfRange::TooLow { axis: 'X', .. })
        ));
        assert!(matches!(
            dropping.feed_rate(0, 127),
            Err(OutOfRange::TooHigh { axis: 'X', .. })
        ));

        let clamping = mapper(RangePolicy::Clamp);
        let high = clamping.feed_rate(0, 127).unwrap();
        assert_eq!(high.rate, 8_000);
        assert!(high.clamped);
        assert_eq!(clamping.feed_rate(0, 0).unwrap().rate, 30);
    }
}
