use crate::events::{Micros, NoteEdge, NoteEvent, TimedEvent};

/// Flattens notes into one chronological on/off stream.
///
/// At equal timestamps note-offs come before note-ons, so a voice released at
/// `t` can be reused by a note starting at `t`. Remaining ties are broken by
/// note index to keep the order deterministic.
pub fn schedule_note_events(notes: &[NoteEvent]) -> Vec<TimedEvent> {
    let mut events: Vec<TimedEvent> = Vec::with_capacity(notes.len() * 2);

    for (note, event) in notes.iter().enumerate() {
        if event.duration == 0 {
            continue;
        }
        events.push(TimedEvent {
            time: event.start,
            note,
            edge: NoteEdge::On,
        });
        events.push(TimedEvent {
            time: event.end(),
            note,
            edge: NoteEdge::Off,
        });
    }

    events.sort_by_key(|e| (e.time, e.edge == NoteEdge::On, e.note));
    events
}

/// Maximum number of notes sounding at the same instant.
pub fn max_polyphony(notes: &[NoteEvent]) -> usize {
    let mut sounding = 0usize;
    let mut peak = 0usize;
    for event in schedule_note_events(notes) {
        match event.edge {
            NoteEdge::On => {
                sounding += 1;
                peak = peak.max(sounding);
            }
            NoteEdge::Off => sounding -= 1,
        }
    }
    peak
}

/// End of the last note, i.e. the length of the song.
pub fn song_end(notes: &[NoteEvent]) -> Micros {
    notes.iter().map(NoteEvent::end).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(pitch: u8, start: Micros, duration: Micros) -> NoteEvent {
        NoteEvent {
            pitch,
            velocity: 100,
            channel: 0,
            start,
            duration,
        }
    }

    #[test]
    fn offs_sort_before_ons_at_same_time() {
        let notes = vec![note(60, 0, 100), note(62, 100, 100)];
        let events = schedule_note_events(&notes);

        assert_eq!(events.len(), 4);
        assert_eq!(events[1].time, 100);
        assert_eq!(events[1].edge, NoteEdge::Off);
        assert_eq!(events[1].note, 0);
        assert_eq!(events[2].edge, NoteEdge::On);
        assert_eq!(events[2].note, 1);
    }

    #[test]
    fn zero_length_notes_are_not_scheduled() {
        let notes = vec![note(60, 0, 0), note(62, 10, 5)];
        let events = schedule_note_events(&notes);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.note == 1));
    }

    #[test]
    fn polyphony_counts_overlaps_only() {
        let notes = vec![
            note(60, 0, 500),
            note(64, 100, 500),
            note(67, 200, 500),
            note(72, 700, 100),
        ];
        assert_eq!(max_polyphony(&notes), 3);

        let touching = vec![note(60, 0, 100), note(62, 100, 100)];
        assert_eq!(max_polyphony(&touching), 1);
    }
}
