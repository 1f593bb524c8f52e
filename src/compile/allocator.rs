// Axis allocation.
//
// Walks the merged note-on/note-off stream and hands each note to one
// physical axis. An axis holds at most one note at a time and, after a note
// ends, stays unavailable for the machine's settle time. When every eligible
// axis is busy the overflow policy decides which note loses.
//
// Priority (lowest first): channel priority, velocity, earlier start, lower
// channel index, lower pitch, then note index. The tuple is compared as a
// whole, so the order is total and the result deterministic.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::pitch::PitchMapper;
use crate::events::{Micros, NoteEdge, NoteEvent};
use crate::timing::schedule_note_events;

/// What happens when a note starts while every eligible axis is sounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Drop whichever of the contending notes has the lowest priority. A
    /// dropped note that was already assigned is removed entirely.
    #[default]
    DropLowestPriority,
    /// Always drop the incoming note.
    DropNewest,
    /// Cut the lowest-priority sounding note short and give its axis to the
    /// incoming note, unless the incoming note ranks lowest itself.
    PreemptLowestPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSetting {
    pub enabled: bool,
    /// Higher wins contention.
    pub priority: u8,
}

impl Default for ChannelSetting {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AllocatorSettings {
    pub policy: OverflowPolicy,
    pub settle: Micros,
    pub min_segment: Micros,
    /// Indexed by MIDI channel; missing entries use the default setting.
    pub channels: Vec<ChannelSetting>,
}

impl AllocatorSettings {
    fn channel(&self, channel: u8) -> ChannelSetting {
        self.channels
            .get(usize::from(channel))
            .copied()
            .unwrap_or_default()
    }
}

/// A note as it will sound on one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Voice {
    pub note: usize,
    pub pitch: u8,
    pub feed_rate: u32,
    pub start: Micros,
    pub end: Micros,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Muted,
    OutOfRange,
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedNote {
    pub note: usize,
    pub reason: DropReason,
}

#[derive(Debug, Clone, Default)]
pub struct Allocation {
    /// Voices per axis, in time order.
    pub axes: Vec<Vec<Voice>>,
    pub dropped: Vec<DroppedNote>,
    pub preempted: usize,
    pub clamped: usize,
}

impl Allocation {
    pub fn dropped_for(&self, reason: DropReason) -> usize {
        self.dropped.iter().filter(|d| d.reason == reason).count()
    }
}

type Priority = (u8, u8, Micros, u8, u8, usize);

#[derive(Debug, Clone, Copy)]
struct Active {
    note: usize,
    /// When the axis became usable before this note took it.
    prior_free_at: Micros,
}

#[derive(Debug, Clone, Copy, Default)]
struct AxisSlot {
    active: Option<Active>,
    free_at: Micros,
}

struct Allocator<'a> {
    notes: &'a [NoteEvent],
    settings: &'a AllocatorSettings,
    slots: Vec<AxisSlot>,
    out: Allocation,
}

pub fn allocate(
    notes: &[NoteEvent],
    mapper: &PitchMapper,
    settings: &AllocatorSettings,
) -> Allocation {
    let axis_count = mapper.axis_count();
    let mut allocator = Allocator {
        notes,
        settings,
        slots: vec![AxisSlot::default(); axis_count],
        out: Allocation {
            axes: vec![Vec::new(); axis_count],
            ..Allocation::default()
        },
    };

    for event in schedule_note_events(notes) {
        match event.edge {
            NoteEdge::Off => allocator.release(event.note, event.time),
            NoteEdge::On => allocator.note_on(event.note, event.time, mapper),
        }
    }

    allocator.out
}

impl Allocator<'_> {
    fn priority(&self, note: usize) -> Priority {
        let n = &self.notes[note];
        (
            self.settings.channel(n.channel).priority,
            n.velocity,
            n.start,
            n.channel,
            n.pitch,
            note,
        )
    }

    fn release(&mut self, note: usize, time: Micros) {
        let settle = self.settings.settle;
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|slot| slot.active.is_some_and(|a| a.note == note))
        {
            slot.active = None;
            slot.free_at = time + settle;
        }
    }

    fn drop_note(&mut self, note: usize, reason: DropReason) {
        let n = &self.notes[note];
        match reason {
            DropReason::Muted => debug!(note, channel = n.channel, "channel disabled, skipping note"),
            _ => warn!(
                note,
                pitch = n.pitch,
                channel = n.channel,
                start_us = n.start,
                ?reason,
                "dropping note"
            ),
        }
        self.out.dropped.push(DroppedNote { note, reason });
    }

    fn assign(&mut self, axis: usize, note: usize, start: Micros, feed_rate: u32) {
        let n = &self.notes[note];
        let slot = &mut self.slots[axis];
        slot.active = Some(Active {
            note,
            prior_free_at: slot.free_at,
        });
        self.out.axes[axis].push(Voice {
            note,
            pitch: n.pitch,
            feed_rate,
            start,
            end: n.end(),
        });
    }

    fn note_on(&mut self, note: usize, time: Micros, mapper: &PitchMapper) {
        let n = self.notes[note];
        if !self.settings.channel(n.channel).enabled {
            self.drop_note(note, DropReason::Muted);
            return;
        }

        let mut rates: Vec<Option<u32>> = Vec::with_capacity(self.slots.len());
        let mut clamped = false;
        for axis in 0..self.slots.len() {
            match mapper.feed_rate(axis, n.pitch) {
                Ok(rate) => {
                    clamped |= rate.clamped;
                    rates.push(Some(rate.rate));
                }
                Err(err) => {
                    debug!(note, %err, "axis cannot play note");
                    rates.push(None);
                }
            }
        }
        if rates.iter().all(Option::is_none) {
            self.drop_note(note, DropReason::OutOfRange);
            return;
        }
        if clamped {
            warn!(note, pitch = n.pitch, "feed rate clamped into axis range");
            self.out.clamped += 1;
        }

        // Least recently used idle axis.
        let free = (0..self.slots.len())
            .filter(|&axis| rates[axis].is_some())
            .filter(|&axis| self.slots[axis].active.is_none() && self.slots[axis].free_at <= time)
            .min_by_key(|&axis| (self.slots[axis].free_at, axis));
        if let Some(axis) = free {
            self.assign(axis, note, time, rates[axis].unwrap_or_default());
            return;
        }

        // An idle axis still settling can take the note late if enough of it
        // remains.
        let settling = (0..self.slots.len())
            .filter(|&axis| rates[axis].is_some() && self.slots[axis].active.is_none())
            .filter(|&axis| n.end().saturating_sub(self.slots[axis].free_at) >= self.settings.min_segment)
            .min_by_key(|&axis| (self.slots[axis].free_at, axis));
        if let Some(axis) = settling {
            let start = self.slots[axis].free_at;
            debug!(note, axis, delay_us = start - time, "note delayed by settle time");
            self.assign(axis, note, start, rates[axis].unwrap_or_default());
            return;
        }

        // Contention: the lowest-priority sounding note on an axis that could
        // also play the incoming one.
        let victim = (0..self.slots.len())
            .filter(|&axis| rates[axis].is_some())
            .filter_map(|axis| self.slots[axis].active.map(|a| (axis, a)))
            .min_by_key(|&(_, active)| self.priority(active.note));
        let Some((axis, active)) = victim else {
            self.drop_note(note, DropReason::Overflow);
            return;
        };
        let incoming_loses = self.priority(note) < self.priority(active.note);

        match self.settings.policy {
            OverflowPolicy::DropNewest => self.drop_note(note, DropReason::Overflow),
            OverflowPolicy::DropLowestPriority if incoming_loses => {
                self.drop_note(note, DropReason::Overflow)
            }
            OverflowPolicy::DropLowestPriority => {
                // The victim never sounds: its axis goes back to the state it
                // was in before the victim claimed it, settle time included.
                let start = time.max(active.prior_free_at);
                if n.end().saturating_sub(start) < self.settings.min_segment {
                    self.drop_note(note, DropReason::Overflow);
                    return;
                }
                self.out.axes[axis].pop();
                self.slots[axis] = AxisSlot {
                    active: None,
                    free_at: active.prior_free_at,
                };
                self.drop_note(active.note, DropReason::Overflow);
                self.assign(axis, note, start, rates[axis].unwrap_or_default());
            }
            OverflowPolicy::PreemptLowestPriority if incoming_loses => {
                self.drop_note(note, DropReason::Overflow)
            }
            OverflowPolicy::PreemptLowestPriority => {
                let start = (time + self.settings.settle).max(active.prior_free_at);
                if n.end().saturating_sub(start) < self.settings.min_segment {
                    self.drop_note(note, DropReason::Overflow);
                    return;
                }
                self.preempt(axis, active, time);
                self.slots[axis].free_at = start;
                self.assign(axis, note, start, rates[axis].unwrap_or_default());
            }
        }
    }

    /// Ends the voice holding `axis` at `time`, removing it when what is left
    /// is too short to execute.
    fn preempt(&mut self, axis: usize, active: Active, time: Micros) {
        let min_segment = self.settings.min_segment;
        let voices = &mut self.out.axes[axis];
        let keep = match voices.last_mut() {
            Some(voice) if voice.note == active.note => {
                // A voice delayed by settle time may not have started yet.
                voice.end = time.max(voice.start);
                voice.end - voice.start >= min_segment
            }
            _ => true,
        };
        self.slots[axis].active = None;
        if keep {
            debug!(note = active.note, axis, end_us = time, "note preempted");
            self.out.preempted += 1;
        } else {
            voices.pop();
            self.drop_note(active.note, DropReason::Overflow);
        }
    }
}
