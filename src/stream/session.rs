// Streaming session.
//
// One session owns one link to one controller. The session thread does the
// writing: wake-up, homing, preamble, then every compiled command in order,
// each only once the flow control has room for it. A reader thread consumes
// responses and a poller thread asks for status reports; both share the
// session's `FlowControl` and stop when it does.
//
// Cancelling sets the flag every wait observes and sends the feed-hold from
// the cancelling thread. The writer is closed in the same critical section,
// so `!` is the last byte the controller sees.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::flow::{FlowControl, Wait};
use super::link::Link;
use super::protocol::{
    LineReader, Response, StatusReport, WAKE_UP, parse_response, realtime, response_limit,
};
use super::{SessionOutcome, StreamError};
use crate::compile::MotionCommand;
use crate::config::MachineConfig;
use crate::song::CompiledSong;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Home with `$H`; otherwise unlock with `$X` and trust the configured
    /// home position.
    pub home: bool,
    pub startup_delay: Duration,
    pub status_interval: Duration,
    pub ack_timeout: Duration,
    pub homing_timeout: Duration,
}

impl SessionOptions {
    pub fn from_config(config: &MachineConfig) -> Self {
        Self {
            home: config.home_on_connect,
            startup_delay: config.startup_delay(),
            status_interval: config.status_interval(),
            ack_timeout: config.ack_timeout(),
            homing_timeout: config.homing_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connecting,
    Homing,
    Streaming,
    Draining,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Phase(SessionPhase),
    /// `acked` of `total` song commands accepted by the controller.
    Progress {
        acked: usize,
        total: usize,
        positions: Vec<f64>,
    },
    Status(StatusReport),
}

/// Estimated axis positions. Nothing is read back from the machine; positions
/// only move when the controller accepts a line.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisState {
    positions: Vec<f64>,
}

impl AxisState {
    fn new(axis_count: usize) -> Self {
        Self {
            positions: vec![0.0; axis_count],
        }
    }

    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    fn apply(&mut self, targets: &[(usize, f64)]) {
        for &(axis, position) in targets {
            self.positions[axis] = position;
        }
    }
}

struct WriterState {
    writer: Box<dyn Write + Send>,
    closed: bool,
}

struct SharedWriter {
    state: Mutex<WriterState>,
}

impl SharedWriter {
    fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            state: Mutex::new(WriterState {
                writer,
                closed: false,
            }),
        }
    }

    /// Returns false once the writer has been closed by a feed-hold.
    fn write(&self, bytes: &[u8]) -> Result<bool, StreamError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(false);
        }
        state.writer.write_all(bytes).map_err(transport)?;
        state.writer.flush().map_err(transport)?;
        Ok(true)
    }

    /// Sends the feed-hold and refuses everything after it. `before` runs
    /// under the writer lock, so no line goes out between it and the `!`.
    fn hold(&self, before: impl FnOnce()) -> io::Result<()> {
        let mut state = self.state.lock();
        before();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.writer.write_all(&[realtime::FEED_HOLD])?;
        state.writer.flush()
    }
}

fn transport(err: io::Error) -> StreamError {
    match err.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof | io::ErrorKind::NotConnected => {
            StreamError::Disconnected
        }
        io::ErrorKind::InvalidData => StreamError::UnexpectedResponse(err.to_string()),
        _ => StreamError::Transport(err),
    }
}

/// Stops a running session from any thread.
#[derive(Clone)]
pub struct Canceller {
    flow: Arc<FlowControl>,
    writer: Arc<SharedWriter>,
}

impl Canceller {
    pub fn cancel(&self) {
        if self.flow.is_cancelled() {
            return;
        }
        info!("stop requested, sending feed hold");
        if let Err(err) = self.writer.hold(|| self.flow.cancel()) {
            warn!(%err, "failed to send feed hold");
        }
    }
}

pub struct SessionHandle {
    canceller: Canceller,
    pub updates: Receiver<SessionUpdate>,
    thread: JoinHandle<Result<SessionOutcome, StreamError>>,
}

impl SessionHandle {
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn join(self) -> Result<SessionOutcome, StreamError> {
        self.thread.join().map_err(|_| StreamError::Panicked)?
    }
}

pub fn spawn_session(
    config: MachineConfig,
    song: CompiledSong,
    link: Link,
    options: SessionOptions,
) -> SessionHandle {
    let Link { reader, writer } = link;
    let flow = Arc::new(FlowControl::new(config.rx_buffer_size));
    let writer = Arc::new(SharedWriter::new(writer));
    let (update_tx, update_rx) = channel::unbounded();

    let session = Session {
        axes: Arc::new(Mutex::new(AxisState::new(config.axis_count()))),
        config,
        song,
        options,
        flow: Arc::clone(&flow),
        writer: Arc::clone(&writer),
        update_tx,
    };
    let thread = thread::spawn(move || session.run(reader));

    SessionHandle {
        canceller: Canceller { flow, writer },
        updates: update_rx,
        thread,
    }
}

struct Session {
    config: MachineConfig,
    song: CompiledSong,
    options: SessionOptions,
    flow: Arc<FlowControl>,
    writer: Arc<SharedWriter>,
    axes: Arc<Mutex<AxisState>>,
    update_tx: Sender<SessionUpdate>,
}

impl Session {
    fn run(self, reader: Box<dyn Read + Send>) -> Result<SessionOutcome, StreamError> {
        let mut helpers = Vec::new();
        let result = self.stream(reader, &mut helpers);
        self.flow.finish();
        for helper in helpers {
            let _ = helper.join();
        }

        match result {
            Ok(Wait::Ready) => {
                info!(commands = self.song.commands.len(), "song finished");
                Ok(SessionOutcome::Completed)
            }
            Ok(Wait::Cancelled) => {
                info!("session cancelled");
                Ok(SessionOutcome::Cancelled)
            }
            Err(_) if self.flow.is_cancelled() => Ok(SessionOutcome::Cancelled),
            Err(err) => {
                error!(%err, "aborting session");
                if let Err(hold_err) = self.writer.hold(|| {}) {
                    debug!(%hold_err, "could not send feed hold after failure");
                }
                Err(err)
            }
        }
    }

    fn phase(&self, phase: SessionPhase) {
        info!(?phase, "session");
        let _ = self.update_tx.send(SessionUpdate::Phase(phase));
    }

    fn stream(
        &self,
        reader: Box<dyn Read + Send>,
        helpers: &mut Vec<JoinHandle<()>>,
    ) -> Result<Wait, StreamError> {
        let starts = self.check_song()?;

        self.phase(SessionPhase::Connecting);
        let mut reader = LineReader::with_limit(reader, response_limit(self.config.rx_buffer_size));
        if !self.writer.write(WAKE_UP)? || !self.flow.pause(self.options.startup_delay) {
            return Ok(Wait::Cancelled);
        }
        self.drain_banner(&mut reader)?;
        if self.flow.is_cancelled() {
            return Ok(Wait::Cancelled);
        }
        helpers.push(self.spawn_reader(reader));
        helpers.push(self.spawn_poller());

        self.phase(SessionPhase::Homing);
        let home_line = if self.options.home {
            "$H"
        } else {
            warn!("homing disabled, unlocking and assuming the configured home position");
            "$X"
        };
        let home: Vec<(usize, f64)> = self.config.axes.iter().map(|a| a.home).enumerate().collect();
        if self.send(home_line, None, home, self.options.homing_timeout)? == Wait::Cancelled
            || self.flow.drain(self.options.homing_timeout)? == Wait::Cancelled
        {
            return Ok(Wait::Cancelled);
        }

        self.phase(SessionPhase::Streaming);
        let mut rapid = String::from("G0");
        for (axis, position) in &starts {
            rapid.push_str(&format!(" {}{:.4}", self.config.axes[*axis].name, position));
        }
        for (line, targets) in [("G21", Vec::new()), ("G90", Vec::new()), (rapid.as_str(), starts)] {
            if self.send(line, None, targets, self.options.ack_timeout)? == Wait::Cancelled {
                return Ok(Wait::Cancelled);
            }
        }

        let window = self.options.ack_timeout + Duration::from_micros(self.song.longest_command());
        for (index, command) in self.song.commands.iter().enumerate() {
            let targets = self.check_limits(index, command)?;
            if self.send(&command.line(), Some(index), targets, window)? == Wait::Cancelled {
                return Ok(Wait::Cancelled);
            }
        }

        self.phase(SessionPhase::Draining);
        self.flow.drain(window)
    }

    /// Matches the song's axes against the machine and returns each axis's
    /// start position.
    fn check_song(&self) -> Result<Vec<(usize, f64)>, StreamError> {
        self.config.validate()?;
        let song: String = self.song.axes.iter().map(|a| a.name).collect();
        let machine: String = self.config.axes.iter().map(|a| a.name).collect();
        if song != machine {
            return Err(StreamError::AxisMismatch { song, machine });
        }

        let mut starts = Vec::with_capacity(self.song.axes.len());
        for (axis, (planned, limits)) in self.song.axes.iter().zip(&self.config.axes).enumerate() {
            if !limits.contains(planned.start) {
                return Err(StreamError::SoftLimit {
                    command: 0,
                    axis: limits.name,
                    target: planned.start,
                    min: limits.min,
                    max: limits.max,
                });
            }
            starts.push((axis, planned.start));
        }
        Ok(starts)
    }

    fn check_limits(&self, index: usize, command: &MotionCommand) -> Result<Vec<(usize, f64)>, StreamError> {
        command
            .moves
            .iter()
            .map(|m| {
                let axis = self
                    .config
                    .axes
                    .iter()
                    .position(|a| a.name == m.axis)
                    .ok_or_else(|| StreamError::AxisMismatch {
                        song: m.axis.to_string(),
                        machine: self.config.axes.iter().map(|a| a.name).collect(),
                    })?;
                let limits = &self.config.axes[axis];
                if !limits.contains(m.target) {
                    return Err(StreamError::SoftLimit {
                        command: index,
                        axis: m.axis,
                        target: m.target,
                        min: limits.min,
                        max: limits.max,
                    });
                }
                Ok((axis, m.target))
            })
            .collect()
    }

    fn send(
        &self,
        line: &str,
        command: Option<usize>,
        targets: Vec<(usize, f64)>,
        window: Duration,
    ) -> Result<Wait, StreamError> {
        if self.flow.reserve(line, command, targets, window)? == Wait::Cancelled {
            return Ok(Wait::Cancelled);
        }
        debug!(line, "send");
        if !self.writer.write(format!("{line}\n").as_bytes())? {
            return Ok(Wait::Cancelled);
        }
        Ok(Wait::Ready)
    }

    /// Reads whatever the controller prints after waking up, until it goes
    /// quiet for one read tick.
    fn drain_banner(&self, reader: &mut LineReader<Box<dyn Read + Send>>) -> Result<(), StreamError> {
        while !self.flow.is_cancelled() {
            let Some(line) = reader.read_line().map_err(transport)? else {
                break;
            };
            match parse_response(&line) {
                Response::Banner(banner) => info!(%banner, "controller ready"),
                Response::Message(message) => info!(%message, "controller"),
                _ => debug!(%line, "start-up output"),
            }
        }
        Ok(())
    }

    fn spawn_reader(&self, reader: LineReader<Box<dyn Read + Send>>) -> JoinHandle<()> {
        let responses = Responses {
            flow: Arc::clone(&self.flow),
            axes: Arc::clone(&self.axes),
            update_tx: self.update_tx.clone(),
            total: self.song.commands.len(),
        };
        thread::spawn(move || responses.run(reader))
    }

    fn spawn_poller(&self) -> JoinHandle<()> {
        let flow = Arc::clone(&self.flow);
        let writer = Arc::clone(&self.writer);
        let interval = self.options.status_interval;
        thread::spawn(move || {
            while flow.pause(interval) {
                match writer.write(&[realtime::STATUS]) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        flow.fail(err);
                        break;
                    }
                }
            }
        })
    }
}

/// The reader thread's side of the session.
struct Responses {
    flow: Arc<FlowControl>,
    axes: Arc<Mutex<AxisState>>,
    update_tx: Sender<SessionUpdate>,
    total: usize,
}

impl Responses {
    fn run(self, mut reader: LineReader<Box<dyn Read + Send>>) {
        while !self.flow.is_stopped() {
            let line = match reader.read_line() {
                Ok(Some(line)) => line,
                Ok(None) => continue,
                Err(err) => {
                    if !self.flow.is_stopped() {
                        self.flow.fail(transport(err));
                    }
                    break;
                }
            };
            if let Err(err) = self.handle(&line) {
                self.flow.fail(err);
                break;
            }
        }
    }

    fn handle(&self, line: &str) -> Result<(), StreamError> {
        match parse_response(line) {
            Response::Ok => {
                let Some(acked) = self.flow.acknowledge() else {
                    return Err(StreamError::UnexpectedResponse(
                        "ok with no line outstanding".to_string(),
                    ));
                };
                let mut axes = self.axes.lock();
                axes.apply(&acked.targets);
                if let Some(command) = acked.command {
                    let _ = self.update_tx.send(SessionUpdate::Progress {
                        acked: command + 1,
                        total: self.total,
                        positions: axes.positions().to_vec(),
                    });
                }
                Ok(())
            }
            Response::Error(code) => {
                let oldest = self.flow.oldest();
                Err(StreamError::Rejected {
                    command: oldest.as_ref().and_then(|p| p.command),
                    line: oldest.map(|p| p.line).unwrap_or_default(),
                    code,
                })
            }
            Response::Alarm(alarm) => Err(StreamError::Alarm(alarm)),
            Response::Status(report) => {
                debug!(state = %report.state, position = ?report.machine_position, "status");
                let _ = self.update_tx.send(SessionUpdate::Status(report));
                Ok(())
            }
            Response::Message(message) => {
                info!(%message, "controller");
                Ok(())
            }
            Response::Banner(_) => Err(StreamError::ControllerReset),
            Response::Unknown(line) => Err(StreamError::UnexpectedResponse(line)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{CompileOptions, compile_song};
    use crate::config::AxisConfig;
    use crate::events::NoteEvent;
    use crate::stream::{VirtualGrbl, VirtualGrblOptions};
    use std::time::Instant;

    const BUFFER: usize = 64;

    fn config() -> MachineConfig {
        let mut config = MachineConfig::with_axes(vec![
            AxisConfig::new('X', 26.667, 50.0, 150.0),
            AxisConfig::new('Y', 26.667, 50.0, 150.0),
        ]);
        config.rx_buffer_size = BUFFER;
        config
    }

    fn options() -> SessionOptions {
        SessionOptions {
            home: true,
            startup_delay: Duration::from_millis(10),
            status_interval: Duration::from_millis(5),
            ack_timeout: Duration::from_secs(2),
            homing_timeout: Duration::from_secs(2),
        }
    }

    fn controller() -> VirtualGrblOptions {
        VirtualGrblOptions {
            rx_buffer_size: BUFFER,
            line_delay: Duration::from_millis(1),
            axes: vec!['X', 'Y'],
            ..VirtualGrblOptions::default()
        }
    }

    /// A two-voice scale, long enough to keep the buffer full.
    fn song(config: &MachineConfig) -> CompiledSong {
        let notes: Vec<NoteEvent> = (0..16u64)
            .map(|i| NoteEvent {
                pitch: 60 + (i % 12) as u8,
                velocity: 100,
                channel: (i % 2) as u8,
                start: i * 60_000,
                duration: 90_000,
            })
            .collect();
        compile_song(notes, config, &CompileOptions::default()).unwrap().song
    }

    fn preamble() -> Vec<String> {
        ["$H", "G21", "G90", "G0 X100.0000 Y100.0000"]
            .map(String::from)
            .to_vec()
    }

    #[test]
    fn streams_every_command_in_order_within_the_buffer() {
        let config = config();
        let song = song(&config);
        let (link, grbl) = VirtualGrbl::spawn(controller());

        let handle = spawn_session(config, song.clone(), link, options());
        let updates = handle.updates.clone();
        assert_eq!(handle.join().unwrap(), SessionOutcome::Completed);

        let transcript = grbl.join();
        let mut expected = preamble();
        expected.extend(song.commands.iter().map(MotionCommand::line));
        assert_eq!(transcript.lines, expected);
        assert!(transcript.max_rx_used <= BUFFER);
        assert!(!transcript.overflowed);

        let updates: Vec<SessionUpdate> = updates.try_iter().collect();
        let last = updates
            .iter()
            .rev()
            .find_map(|u| match u {
                SessionUpdate::Progress {
                    acked,
                    total,
                    positions,
                } => Some((*acked, *total, positions.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(last.0, song.commands.len());
        assert_eq!(last.1, song.commands.len());
        assert_eq!(last.2.len(), 2);
        assert!(updates.contains(&SessionUpdate::Phase(SessionPhase::Draining)));
    }

    #[test]
    fn cancel_sends_feed_hold_last_and_returns_promptly() {
        let config = config();
        let song = song(&config);
        let (link, grbl) = VirtualGrbl::spawn(VirtualGrblOptions {
            stall_after: Some(6),
            ..controller()
        });

        let handle = spawn_session(config, song, link, options());
        loop {
            match handle.updates.recv_timeout(Duration::from_secs(5)).unwrap() {
                SessionUpdate::Progress { acked, .. } if acked >= 2 => break,
                _ => {}
            }
        }
        thread::sleep(Duration::from_millis(50));
        let sent_before = grbl.transcript().lines.len();

        let started = Instant::now();
        handle.cancel();
        assert_eq!(handle.join().unwrap(), SessionOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));

        let transcript = grbl.join();
        assert_eq!(transcript.lines.len(), sent_before);
        assert_eq!(transcript.last_byte, Some(realtime::FEED_HOLD));
        assert_eq!(transcript.realtime.last(), Some(&realtime::FEED_HOLD));
        assert!(transcript.max_rx_used <= BUFFER);
    }

    #[test]
    fn error_response_aborts_with_the_failing_command() {
        let config = config();
        let song = song(&config);
        let (link, grbl) = VirtualGrbl::spawn(VirtualGrblOptions {
            error_at: Some((5, 20)),
            ..controller()
        });

        let err = spawn_session(config, song.clone(), link, options()).join().unwrap_err();
        match err {
            StreamError::Rejected { command, line, code } => {
                assert_eq!(command, Some(1));
                assert_eq!(line, song.commands[1].line());
                assert_eq!(code, 20);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(grbl.join().last_byte, Some(realtime::FEED_HOLD));
    }

    #[test]
    fn homing_that_never_finishes_times_out() {
        let config = config();
        let song = song(&config);
        let (link, _grbl) = VirtualGrbl::spawn(VirtualGrblOptions {
            stall_after: Some(0),
            ..controller()
        });
        let options = SessionOptions {
            homing_timeout: Duration::from_millis(50),
            ..options()
        };

        let err = spawn_session(config, song, link, options).join().unwrap_err();
        assert!(matches!(
            err,
            StreamError::AckTimeout { command: None, ref line, .. } if line == "$H"
        ));
    }

    #[test]
    fn target_outside_soft_limits_is_never_sent() {
        let config = config();
        let mut song = song(&config);
        song.commands[3].moves[0].target = 150.5;
        let bad_line = song.commands[3].line();
        let (link, grbl) = VirtualGrbl::spawn(controller());

        let err = spawn_session(config, song, link, options()).join().unwrap_err();
        assert!(matches!(
            err,
            StreamError::SoftLimit { command: 3, max, .. } if max == 150.0
        ));
        let transcript = grbl.join();
        assert!(!transcript.lines.contains(&bad_line));
        assert_eq!(transcript.lines.len(), preamble().len() + 3);
    }

    #[test]
    fn unlock_instead_of_homing() {
        let config = config();
        let song = song(&config);
        let (link, grbl) = VirtualGrbl::spawn(controller());
        let options = SessionOptions {
            home: false,
            ..options()
        };

        assert_eq!(
            spawn_session(config, song, link, options).join().unwrap(),
            SessionOutcome::Completed
        );
        assert_eq!(grbl.join().lines[0], "$X");
    }

    #[test]
    fn lost_connection_is_fatal() {
        let config = config();
        let song = song(&config);
        let (link, grbl) = VirtualGrbl::spawn(VirtualGrblOptions {
            hang_up_after: Some(preamble().len() + 2),
            ..controller()
        });

        let err = spawn_session(config, song.clone(), link, options()).join().unwrap_err();
        assert!(matches!(err, StreamError::Disconnected), "got {err:?}");

        let transcript = grbl.join();
        let mut expected = preamble();
        expected.extend(song.commands.iter().map(MotionCommand::line));
        assert!(transcript.lines.len() < expected.len());
        assert_eq!(transcript.lines, expected[..transcript.lines.len()]);
    }

    #[test]
    fn acknowledgment_without_a_pending_line_is_rejected() {
        let (update_tx, _updates) = channel::unbounded();
        let responses = Responses {
            flow: Arc::new(FlowControl::new(BUFFER)),
            axes: Arc::new(Mutex::new(AxisState::new(2))),
            update_tx,
            total: 0,
        };
        assert!(matches!(
            responses.handle("ok"),
            Err(StreamError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn endless_controller_output_is_a_protocol_error() {
        let err = transport(io::Error::new(io::ErrorKind::InvalidData, "no line break"));
        assert!(matches!(err, StreamError::UnexpectedResponse(_)));
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn cancel_flag_is_raised_under_the_writer_lock() {
        let capture = Capture::default();
        let canceller = Canceller {
            flow: Arc::new(FlowControl::new(BUFFER)),
            writer: Arc::new(SharedWriter::new(Box::new(capture.clone()))),
        };

        let guard = canceller.writer.state.lock();
        let cancelling = {
            let canceller = canceller.clone();
            thread::spawn(move || canceller.cancel())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!canceller.flow.is_cancelled());
        drop(guard);
        cancelling.join().unwrap();

        assert!(canceller.flow.is_cancelled());
        assert!(!canceller.writer.write(b"G1 X1\n").unwrap());
        assert_eq!(*capture.0.lock(), vec![realtime::FEED_HOLD]);
    }
}
