use std::collections::BTreeMap;

use crate::events::NoteEvent;

/// Takes notes where the same key on the same channel may overlap itself and
/// returns them merged, with the guarantee that no two notes share
/// (channel, pitch) at any instant. Output is ordered by start time.
pub fn normalize_notes(mut notes: Vec<NoteEvent>) -> Vec<NoteEvent> {
    let mut by_key: BTreeMap<(u8, u8), Vec<NoteEvent>> = BTreeMap::new();
    for note in notes.drain(..) {
        by_key
            .entry((note.channel, note.pitch))
            .or_default()
            .push(note);
    }

    let mut result = Vec::new();

    for (_key, mut group) in by_key {
        group.sort_by_key(|n| (n.start, n.duration));

        let mut current = group[0];

        for note in group.into_iter().skip(1) {
            let current_end = current.end();

            if note.start < current_end {
                let new_end = current_end.max(note.end());
                current.duration = new_end - current.start;
                current.velocity = current.velocity.max(note.velocity);
            } else {
                result.push(current);
                current = note;
            }
        }

        result.push(current);
    }

    result.sort_by_key(|n| (n.start, n.channel, n.pitch));
    result
}

/// Splits notes first-fit into parts so that no part ever has more than
/// `voices` notes sounding at once. Each part keeps start-time order.
pub fn split_into_parts(notes: &[NoteEvent], voices: usize) -> Vec<Vec<NoteEvent>> {
    let mut ordered = notes.to_vec();
    ordered.sort_by_key(|n| (n.start, n.channel, n.pitch));

    let mut parts: Vec<Vec<NoteEvent>> = Vec::new();
    for note in ordered {
        match parts
            .iter_mut()
            .find(|part| peak_overlap_with(part, &note) < voices)
        {
            Some(part) => part.push(note),
            None => parts.push(vec![note]),
        }
    }
    parts
}

/// Highest number of notes in `part` sounding together at any instant inside
/// `note`'s span.
fn peak_overlap_with(part: &[NoteEvent], note: &NoteEvent) -> usize {
    let mut edges: Vec<(u64, i32)> = Vec::new();
    for other in part {
        if other.start < note.end() && other.end() > note.start {
            edges.push((other.start.max(note.start), 1));
            edges.push((other.end().min(note.end()), -1));
        }
    }
    edges.sort_by_key(|&(time, delta)| (time, delta));

    let mut sounding = 0i32;
    let mut peak = 0i32;
    for (_, delta) in edges {
        sounding += delta;
        peak = peak.max(sounding);
    }
    peak as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timing::max_polyphony;

    fn note(channel: u8, pitch: u8, start: u64, duration: u64) -> NoteEvent {
        NoteEvent {
            pitch,
            velocity: 64,
            channel,
            start,
            duration,
        }
    }

    #[test]
    fn merges_overlapping_same_key() {
        let mut loud = note(0, 60, 50, 100);
        loud.velocity = 120;
        let notes = vec![note(0, 60, 0, 100), loud, note(0, 60, 400, 10)];

        let merged = normalize_notes(notes);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].start, 0);
        assert_eq!(merged[0].duration, 150);
        assert_eq!(merged[0].velocity, 120);
        assert_eq!(merged[1].start, 400);
    }

    #[test]
    fn keeps_same_pitch_on_other_channels() {
        let notes = vec![note(0, 60, 0, 100), note(1, 60, 50, 100)];
        assert_eq!(normalize_notes(notes).len(), 2);
    }

    #[test]
    fn split_respects_voice_count() {
        let notes = vec![
            note(0, 60, 0, 1000),
            note(0, 64, 0, 1000),
            note(0, 67, 0, 1000),
            note(0, 72, 500, 1000),
            note(0, 48, 1200, 100),
        ];

        let parts = split_into_parts(&notes, 2);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts.iter().map(Vec::len).sum::<usize>(), notes.len());
        for part in &parts {
            assert!(max_polyphony(part) <= 2);
        }
    }
}
