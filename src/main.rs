// CLI entry point for whirr.
//
// Compiles MIDI files into motion programs for a GRBL machine and streams
// them over a serial port. Compilation and streaming are separate steps so a
// song can be checked offline before anything moves.
//
// Usage:
//   whirr compile <song.mid> --config <machine.ron> [OPTIONS]
//     --out <file.ron>                 Output path (default: next to the input)
//     --speed <X>                      Tempo multiplier (default: 1.0)
//     --policy <drop-lowest|drop-newest|preempt>
//     --clamp                          Clamp out-of-range pitches instead of dropping
//     --mute <CH>                      Skip MIDI channel CH (1-16), repeatable
//     --priority <CH=P>                Contention priority for channel CH, repeatable
//     --split                          Write one file per part that fits the axes
//   whirr stream <song.ron> --config <machine.ron> [--port <dev>] [--dry-run]
//   whirr inspect <song.mid|song.ron> [--config <machine.ron>]
//   whirr ports

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread;

use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

use whirr::compile::{ChannelSetting, MIDI_CHANNELS, OverflowPolicy, PitchMapper, RangePolicy};
use whirr::midi::{self, MidiError};
use whirr::stream::{
    SessionUpdate, StreamError, VirtualGrbl, VirtualGrblOptions, available_ports, open_serial,
};
use whirr::timing::{max_polyphony, normalize_notes, song_end};
use whirr::{
    CompileError, CompileOptions, CompileReport, CompiledSong, ConfigError, MachineConfig,
    SessionOptions, SessionOutcome, SongError, compile_parts, compile_song, spawn_session,
};

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Midi(#[from] MidiError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Song(#[from] SongError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("no serial port given; pass --port or set `port` in the machine config")]
    NoPort,
}

struct CompileArgs {
    input: PathBuf,
    config: PathBuf,
    out: Option<PathBuf>,
    speed: f64,
    overflow: OverflowPolicy,
    range: RangePolicy,
    channels: Vec<ChannelSetting>,
    split: bool,
}

struct StreamArgs {
    song: PathBuf,
    config: PathBuf,
    port: Option<String>,
    dry_run: bool,
}

enum Command {
    Compile(CompileArgs),
    Stream(StreamArgs),
    Inspect { input: PathBuf, config: Option<PathBuf> },
    Ports,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let result = match parse_args() {
        Command::Compile(args) => run_compile(args),
        Command::Stream(args) => run_stream(args),
        Command::Inspect { input, config } => run_inspect(&input, config.as_deref()),
        Command::Ports => run_ports(),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run_compile(args: CompileArgs) -> Result<(), AppError> {
    let config = MachineConfig::load(&args.config)?;
    let notes = midi::decode_file(&args.input, args.speed)?;
    let options = CompileOptions {
        name: file_stem(&args.input),
        overflow: args.overflow,
        range: args.range,
        channels: args.channels,
    };
    let out = args.out.unwrap_or_else(|| args.input.with_extension("ron"));

    if args.split {
        for part in compile_parts(notes, &config, &options)? {
            let path = out.with_file_name(format!("{}.ron", part.song.name));
            part.song.save(&path)?;
            print_report(&path, &part.report);
        }
    } else {
        let compiled = compile_song(notes, &config, &options)?;
        compiled.song.save(&out)?;
        print_report(&out, &compiled.report);
    }
    Ok(())
}

fn print_report(path: &Path, report: &CompileReport) {
    println!("Wrote {}", path.display());
    println!(
        "  {} notes, {} commands, {:.1} s",
        report.notes,
        report.commands,
        report.duration as f64 / 1_000_000.0
    );
    println!("  max polyphony {}", report.max_polyphony);
    if report.dropped() > 0 {
        println!(
            "  dropped {}: {} zero-length, {} muted, {} out of range, {} over polyphony",
            report.dropped(),
            report.zero_length,
            report.muted,
            report.out_of_range,
            report.overflow
        );
    }
    if report.merged + report.preempted + report.clamped > 0 {
        println!(
            "  merged {}, preempted {}, clamped {}",
            report.merged, report.preempted, report.clamped
        );
    }
}

fn run_stream(args: StreamArgs) -> Result<(), AppError> {
    let config = MachineConfig::load(&args.config)?;
    let song = CompiledSong::load(&args.song)?;

    let (link, simulator) = if args.dry_run {
        let (link, grbl) = VirtualGrbl::spawn(VirtualGrblOptions {
            rx_buffer_size: config.rx_buffer_size,
            axes: config.axes.iter().map(|a| a.name).collect(),
            ..VirtualGrblOptions::default()
        });
        (link, Some(grbl))
    } else {
        let port = args.port.or_else(|| config.port.clone()).ok_or(AppError::NoPort)?;
        (open_serial(&port, &config)?, None)
    };

    println!(
        "Streaming '{}' ({} commands, {:.1} s). Press Enter to stop.",
        song.name,
        song.commands.len(),
        song.duration as f64 / 1_000_000.0
    );
    let options = SessionOptions::from_config(&config);
    let handle = spawn_session(config, song, link, options);

    let canceller = handle.canceller();
    thread::spawn(move || {
        let mut line = String::new();
        if matches!(std::io::stdin().read_line(&mut line), Ok(n) if n > 0) {
            canceller.cancel();
        }
    });

    let mut shown = 0;
    for update in handle.updates.iter() {
        if let SessionUpdate::Progress { acked, total, .. } = update {
            let percent = acked * 100 / total.max(1);
            if percent >= shown + 10 || acked == total {
                println!("{percent:>3}% ({acked}/{total})");
                shown = percent - percent % 10;
            }
        }
    }

    let outcome = handle.join()?;
    if let Some(grbl) = simulator {
        let transcript = grbl.transcript();
        println!(
            "Dry run: {} lines sent, peak receive buffer {} bytes",
            transcript.lines.len(),
            transcript.max_rx_used
        );
    }
    match outcome {
        SessionOutcome::Completed => println!("Done."),
        SessionOutcome::Cancelled => println!("Stopped."),
    }
    Ok(())
}

fn run_inspect(input: &Path, config: Option<&Path>) -> Result<(), AppError> {
    let config = config.map(MachineConfig::load).transpose()?;

    if input.extension().is_some_and(|ext| ext == "ron") {
        let song = CompiledSong::load(input)?;
        let dwells = song.commands.iter().filter(|c| c.is_dwell()).count();
        let axes: String = song.axes.iter().map(|a| a.name).collect();
        println!("{}: compiled for axes {axes}", song.name);
        println!(
            "  {} commands ({dwells} dwells), {:.1} s, longest command {:.3} s",
            song.commands.len(),
            song.duration as f64 / 1_000_000.0,
            song.longest_command() as f64 / 1_000_000.0
        );
        if let Some(line) = song.commands.iter().map(|c| c.line()).max_by_key(String::len) {
            println!("  longest line {} bytes: {line}", line.len() + 1);
        }
        return Ok(());
    }

    let notes = normalize_notes(midi::decode_file(input, 1.0)?);
    let channels: BTreeSet<u8> = notes.iter().map(|n| n.channel + 1).collect();
    println!("{}: {} notes, {:.1} s", input.display(), notes.len(), song_end(&notes) as f64 / 1_000_000.0);
    println!("  channels {channels:?}");
    println!("  max polyphony {}", max_polyphony(&notes));
    if let (Some(low), Some(high)) = (notes.iter().map(|n| n.pitch).min(), notes.iter().map(|n| n.pitch).max()) {
        println!("  pitch range {low}..={high}");
    }

    if let Some(config) = config {
        let mapper = PitchMapper::new(&config, RangePolicy::Drop);
        for (index, axis) in config.axes.iter().enumerate() {
            match mapper.supported_range(index) {
                Some((low, high)) => {
                    let outside = notes.iter().filter(|n| n.pitch < low || n.pitch > high).count();
                    println!("  axis {}: pitches {low}..={high}, {outside} notes out of range", axis.name);
                }
                None => println!("  axis {}: cannot play any pitch", axis.name),
            }
        }
    }
    Ok(())
}

fn run_ports() -> Result<(), AppError> {
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "song".to_string())
}

fn fail(message: &str) -> ! {
    eprintln!("{message}");
    print_usage();
    std::process::exit(1);
}

fn value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> &'a str {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .unwrap_or_else(|| fail(&format!("{flag} requires a value")))
}

fn channel(text: &str) -> usize {
    match text.parse::<usize>() {
        Ok(ch) if (1..=MIDI_CHANNELS).contains(&ch) => ch - 1,
        _ => fail(&format!("invalid MIDI channel '{text}' (expected 1-16)")),
    }
}

/// Parses `std::env::args()` by hand; there are few enough flags.
fn parse_args() -> Command {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        fail("missing command");
    };

    let mut positional: Vec<PathBuf> = Vec::new();
    let mut config = None;
    let mut out = None;
    let mut port = None;
    let mut speed = 1.0;
    let mut overflow = OverflowPolicy::default();
    let mut range = RangePolicy::default();
    let mut channels = vec![ChannelSetting::default(); MIDI_CHANNELS];
    let mut split = false;
    let mut dry_run = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => config = Some(PathBuf::from(value(&args, &mut i, "--config"))),
            "--out" => out = Some(PathBuf::from(value(&args, &mut i, "--out"))),
            "--port" => port = Some(value(&args, &mut i, "--port").to_string()),
            "--speed" => {
                speed = value(&args, &mut i, "--speed")
                    .parse()
                    .unwrap_or_else(|_| fail("--speed requires a number"));
            }
            "--policy" => {
                overflow = match value(&args, &mut i, "--policy") {
                    "drop-lowest" => OverflowPolicy::DropLowestPriority,
                    "drop-newest" => OverflowPolicy::DropNewest,
                    "preempt" => OverflowPolicy::PreemptLowestPriority,
                    other => fail(&format!("unknown policy '{other}'")),
                };
            }
            "--clamp" => range = RangePolicy::Clamp,
            "--mute" => channels[channel(value(&args, &mut i, "--mute"))].enabled = false,
            "--priority" => {
                let setting = value(&args, &mut i, "--priority");
                let Some((ch, priority)) = setting.split_once('=') else {
                    fail("--priority expects CH=P");
                };
                channels[channel(ch)].priority = priority
                    .parse()
                    .unwrap_or_else(|_| fail("--priority expects a priority from 0 to 255"));
            }
            "--split" => split = true,
            "--dry-run" => dry_run = true,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            flag if flag.starts_with("--") => fail(&format!("unknown argument: {flag}")),
            path => positional.push(PathBuf::from(path)),
        }
        i += 1;
    }

    let require_input = |positional: &mut Vec<PathBuf>| match positional.len() {
        1 => positional.remove(0),
        0 => fail(&format!("{command} requires an input file")),
        _ => fail(&format!("{command} takes a single input file")),
    };
    let require_config =
        |config: Option<PathBuf>| config.unwrap_or_else(|| fail(&format!("{command} requires --config")));

    match command.as_str() {
        "compile" => Command::Compile(CompileArgs {
            input: require_input(&mut positional),
            config: require_config(config),
            out,
            speed,
            overflow,
            range,
            channels,
            split,
        }),
        "stream" => Command::Stream(StreamArgs {
            song: require_input(&mut positional),
            config: require_config(config),
            port,
            dry_run,
        }),
        "inspect" => Command::Inspect {
            input: require_input(&mut positional),
            config,
        },
        "ports" => Command::Ports,
        "--help" | "-h" | "help" => {
            print_usage();
            std::process::exit(0);
        }
        other => fail(&format!("unknown command: {other}")),
    }
}

fn print_usage() {
    println!("Usage: whirr <COMMAND> [OPTIONS]");
    println!();
    println!("Commands:");
    println!("  compile <song.mid> --config <machine.ron>   Compile a MIDI file");
    println!("      --out <file.ron>        Output path (default: next to the input)");
    println!("      --speed <X>             Tempo multiplier (default: 1.0)");
    println!("      --policy <P>            drop-lowest (default), drop-newest or preempt");
    println!("      --clamp                 Clamp out-of-range pitches instead of dropping");
    println!("      --mute <CH>             Skip MIDI channel CH (1-16)");
    println!("      --priority <CH=P>       Priority of channel CH when axes run out");
    println!("      --split                 One output file per part that fits the axes");
    println!("  stream <song.ron> --config <machine.ron>    Play a compiled song");
    println!("      --port <dev>            Serial port (default: from the config)");
    println!("      --dry-run               Stream to a simulated controller");
    println!("  inspect <song.mid|song.ron> [--config <machine.ron>]");
    println!("  ports                       List serial ports");
}
