use std::time::Duration;

use midly::num::{u4, u7, u15, u24, u28};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};

use whirr::compile::MotionCommand;
use whirr::stream::{VirtualGrbl, VirtualGrblOptions, realtime};
use whirr::{
    CompileOptions, CompiledSong, MachineConfig, SessionOptions, SessionOutcome, compile_song,
    midi, spawn_session,
};

const MACHINE: &str = r#"
    MachineConfig(
        axes: [
            AxisConfig(name: 'X', steps_per_mm: 26.667, min: 50.0, max: 150.0, start: 100.0),
            AxisConfig(name: 'Y', steps_per_mm: 26.667, min: 50.0, max: 150.0, start: 100.0),
        ],
        rx_buffer_size: 96,
    )
"#;

fn note(delta: u32, key: u8, vel: u8) -> TrackEvent<'static> {
    TrackEvent {
        delta: u28::new(delta),
        kind: TrackEventKind::Midi {
            channel: u4::new(0),
            message: MidiMessage::NoteOn {
                key: u7::new(key),
                vel: u7::new(vel),
            },
        },
    }
}

/// Three-note chords at 120 BPM: one voice more than the machine has axes.
fn chords() -> Vec<u8> {
    let mut smf = Smf::new(Header::new(Format::SingleTrack, Timing::Metrical(u15::new(96))));
    let mut track = vec![TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(500_000))),
    }];
    for root in [60u8, 62, 64, 65] {
        track.push(note(0, root, 100));
        track.push(note(0, root + 4, 80));
        track.push(note(0, root + 7, 40));
        track.push(note(96, root, 0));
        track.push(note(0, root + 4, 0));
        track.push(note(0, root + 7, 0));
    }
    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    smf.tracks.push(track);

    let mut bytes = Vec::new();
    smf.write(&mut bytes).unwrap();
    bytes
}

#[test]
fn midi_to_controller() {
    let config = MachineConfig::from_ron_str(MACHINE).unwrap();
    let notes = midi::decode_bytes(&chords(), 1.0).unwrap();
    assert_eq!(notes.len(), 12);

    let compiled = compile_song(notes, &config, &CompileOptions::default()).unwrap();
    // The quietest note of each chord loses its axis.
    assert_eq!(compiled.report.overflow, 4);
    assert_eq!(compiled.report.max_polyphony, 3);
    assert_eq!(compiled.song.duration, 2_000_000);

    let path = std::env::temp_dir().join(format!("whirr-pipeline-{}.ron", std::process::id()));
    compiled.song.save(&path).unwrap();
    let song = CompiledSong::load(&path).unwrap();
    let _ = std::fs::remove_file(&path);
    assert_eq!(song, compiled.song);

    let (link, grbl) = VirtualGrbl::spawn(VirtualGrblOptions {
        rx_buffer_size: config.rx_buffer_size,
        line_delay: Duration::from_millis(1),
        axes: vec!['X', 'Y'],
        ..VirtualGrblOptions::default()
    });
    let options = SessionOptions {
        startup_delay: Duration::from_millis(10),
        status_interval: Duration::from_millis(10),
        ..SessionOptions::from_config(&config)
    };
    let outcome = spawn_session(config.clone(), song.clone(), link, options).join().unwrap();
    assert_eq!(outcome, SessionOutcome::Completed);

    let transcript = grbl.join();
    assert!(!transcript.overflowed);
    assert!(transcript.max_rx_used <= config.rx_buffer_size);
    assert_ne!(transcript.last_byte, Some(realtime::FEED_HOLD));

    let streamed: Vec<&str> = transcript.lines.iter().skip(4).map(String::as_str).collect();
    let compiled_lines: Vec<String> = song.commands.iter().map(MotionCommand::line).collect();
    assert_eq!(streamed, compiled_lines);
    for command in &song.commands {
        assert!(command.moves.len() <= config.axis_count());
        for m in &command.moves {
            let axis = config.axes.iter().find(|a| a.name == m.axis).unwrap();
            assert!(axis.contains(m.target));
        }
    }
}
