use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::compile::MotionCommand;
use crate::config::MachineConfig;
use crate::events::Micros;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SongError {
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize song: {0}")]
    Serialize(#[from] ron::Error),
    #[error("malformed song file: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("song format version {found} is not supported (expected {FORMAT_VERSION})")]
    Version { found: u32 },
}

/// Axis a song was compiled for, and where it expects that axis to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongAxis {
    pub name: char,
    pub start: f64,
}

/// The compiled, ready-to-stream form of a song.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledSong {
    pub name: String,
    pub version: u32,
    pub axes: Vec<SongAxis>,
    pub duration: Micros,
    pub commands: Vec<MotionCommand>,
}

impl CompiledSong {
    pub fn new(name: &str, config: &MachineConfig, duration: Micros, commands: Vec<MotionCommand>) -> Self {
        Self {
            name: name.to_string(),
            version: FORMAT_VERSION,
            axes: config
                .axes
                .iter()
                .map(|axis| SongAxis {
                    name: axis.name,
                    start: axis.start,
                })
                .collect(),
            duration,
            commands,
        }
    }

    /// Longest expected execution time of a single command.
    pub fn longest_command(&self) -> Micros {
        self.commands.iter().map(|c| c.duration).max().unwrap_or(0)
    }

    pub fn to_ron_string(&self) -> Result<String, SongError> {
        Ok(ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }

    pub fn from_ron_str(text: &str) -> Result<Self, SongError> {
        let song: CompiledSong = ron::from_str(text)?;
        if song.version != FORMAT_VERSION {
            return Err(SongError::Version {
                found: song.version,
            });
        }
        Ok(song)
    }

    pub fn save(&self, path: &Path) -> Result<(), SongError> {
        let io_err = |source| SongError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        fs::write(path, self.to_ron_string()?).map_err(io_err)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SongError> {
        let text = fs::read_to_string(path).map_err(|source| SongError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::AxisMove;
    use crate::config::AxisConfig;

    fn song() -> CompiledSong {
        let config = MachineConfig::with_axes(vec![
            AxisConfig::new('X', 26.667, 50.0, 150.0),
            AxisConfig::new('Y', 26.667, 50.0, 150.0),
        ]);
        let commands = vec![
            MotionCommand {
                start: 0,
                duration: 123_457,
                feed: 0.0,
                moves: vec![],
            },
            MotionCommand {
                start: 123_457,
                duration: 333_333,
                feed: 1_237.456_789_012_3,
                moves: vec![
                    AxisMove {
                        axis: 'X',
                        feed_rate: 990,
                        distance: 5.5,
                        target: 105.5,
                    },
                    AxisMove {
                        axis: 'Y',
                        feed_rate: 1_047,
                        distance: -0.1234,
                        target: 99.8766,
                    },
                ],
            },
        ];
        CompiledSong::new("scale", &config, 456_790, commands)
    }

    #[test]
    fn save_then_load_is_lossless() {
        let original = song();
        let path = std::env::temp_dir().join(format!("whirr-song-{}.ron", std::process::id()));

        original.save(&path).unwrap();
        let loaded = CompiledSong::load(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded, original);
        let lines: Vec<String> = loaded.commands.iter().map(MotionCommand::line).collect();
        assert_eq!(lines, ["G4 P0.123", "G1 X105.5000 Y99.8766 F1237.457"]);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut future = song();
        future.version = FORMAT_VERSION + 1;
        let text = ron::ser::to_string(&future).unwrap();
        assert!(matches!(
            CompiledSong::from_ron_str(&text),
            Err(SongError::Version { .. })
        ));
    }
}
