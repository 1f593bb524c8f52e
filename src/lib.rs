pub mod compile;
pub mod config;
pub mod events;
pub mod midi;
pub mod song;
pub mod stream;
pub mod timing;

pub use compile::{CompileError, CompileOptions, CompileReport, Compiled, compile_parts, compile_song};
pub use config::{AxisConfig, ConfigError, MachineConfig};
pub use events::{Micros, NoteEvent};
pub use song::{CompiledSong, SongError};
pub use stream::{SessionHandle, SessionOptions, SessionOutcome, StreamError, spawn_session};
