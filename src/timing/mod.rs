mod scheduler;
mod sequence;

pub use scheduler::{max_polyphony, schedule_note_events, song_end};
pub use sequence::{normalize_notes, split_into_parts};
