// In-process stand-in for a GRBL controller.
//
// Behaves like the real firmware as far as the streamer can tell: a start-up
// banner, one `ok` per received line (empty lines included), a bounded
// receive buffer that only drains as lines are consumed, and real-time bytes
// handled as soon as they arrive. Lines are consumed at a fixed pace so the
// host actually has to wait for buffer space. Faults can be injected.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::debug;

use super::link::Link;
use super::protocol::realtime;

pub const BANNER: &str = "Grbl 1.1h ['$' for help]";

const IDLE_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct VirtualGrblOptions {
    pub rx_buffer_size: usize,
    /// Time the controller spends on each line before acknowledging it.
    pub line_delay: Duration,
    pub banner: bool,
    /// Stop acknowledging after this many non-empty lines.
    pub stall_after: Option<usize>,
    /// Answer the n-th non-empty line (0-based) with `error:<code>`.
    pub error_at: Option<(usize, u32)>,
    /// Drop the connection once this many non-empty lines were handled.
    pub hang_up_after: Option<usize>,
    /// Axis letters reported in status replies.
    pub axes: Vec<char>,
    /// How long a host read waits before timing out.
    pub read_timeout: Duration,
}

impl Default for VirtualGrblOptions {
    fn default() -> Self {
        Self {
            rx_buffer_size: 128,
            line_delay: Duration::from_millis(2),
            banner: true,
            stall_after: None,
            error_at: None,
            hang_up_after: None,
            axes: vec!['X', 'Y', 'Z'],
            read_timeout: Duration::from_millis(20),
        }
    }
}

/// Everything the controller received.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    /// Non-empty lines in arrival order.
    pub lines: Vec<String>,
    /// Real-time bytes in arrival order.
    pub realtime: Vec<u8>,
    pub last_byte: Option<u8>,
    /// Highest receive-buffer occupancy seen, in bytes.
    pub max_rx_used: usize,
    pub overflowed: bool,
}

pub struct VirtualGrbl {
    transcript: Arc<Mutex<Transcript>>,
    thread: Option<JoinHandle<()>>,
}

impl VirtualGrbl {
    pub fn spawn(options: VirtualGrblOptions) -> (Link, VirtualGrbl) {
        let (host_tx, from_host) = channel::unbounded();
        let (to_host, host_rx) = channel::unbounded();
        let transcript = Arc::new(Mutex::new(Transcript::default()));

        let link = Link::new(
            ChannelReader {
                rx: host_rx,
                pending: VecDeque::new(),
                timeout: options.read_timeout,
            },
            ChannelWriter { tx: host_tx },
        );

        let mut simulator = Simulator {
            position: vec![0.0; options.axes.len()],
            options,
            to_host,
            transcript: Arc::clone(&transcript),
            partial: Vec::new(),
            queue: VecDeque::new(),
            rx_used: 0,
            handled: 0,
            held: false,
            next_ack_at: Instant::now(),
        };
        let thread = thread::spawn(move || simulator.run(from_host));

        (
            link,
            VirtualGrbl {
                transcript,
                thread: Some(thread),
            },
        )
    }

    pub fn transcript(&self) -> Transcript {
        self.transcript.lock().clone()
    }

    /// Waits for the connection to close and returns what was received.
    pub fn join(mut self) -> Transcript {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.transcript()
    }
}

struct Simulator {
    options: VirtualGrblOptions,
    to_host: Sender<Vec<u8>>,
    transcript: Arc<Mutex<Transcript>>,
    partial: Vec<u8>,
    /// Received lines not yet consumed, with their size on the wire.
    queue: VecDeque<(String, usize)>,
    rx_used: usize,
    handled: usize,
    held: bool,
    next_ack_at: Instant,
    position: Vec<f64>,
}

impl Simulator {
    fn run(&mut self, from_host: Receiver<Vec<u8>>) {
        if self.options.banner {
            self.reply(&format!("\r\n{BANNER}"));
        }

        while !self.hung_up() {
            let wait = if self.can_consume() {
                self.next_ack_at.saturating_duration_since(Instant::now())
            } else {
                IDLE_TICK
            };
            match from_host.recv_timeout(wait) {
                Ok(bytes) => bytes.into_iter().for_each(|b| self.receive(b)),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.consume(Instant::now());
        }
        debug!(handled = self.handled, "virtual controller: connection closed");
    }

    fn hung_up(&self) -> bool {
        self.options.hang_up_after.is_some_and(|n| self.handled >= n)
    }

    fn reply(&self, text: &str) {
        let _ = self.to_host.send(format!("{text}\r\n").into_bytes());
    }

    fn receive(&mut self, byte: u8) {
        let mut transcript = self.transcript.lock();
        transcript.last_byte = Some(byte);

        if realtime::is_realtime(byte) {
            transcript.realtime.push(byte);
            drop(transcript);
            match byte {
                realtime::STATUS => self.reply(&self.status()),
                realtime::FEED_HOLD => self.held = true,
                realtime::RESUME => self.held = false,
                _ => {
                    self.partial.clear();
                    self.queue.clear();
                    self.rx_used = 0;
                    self.held = false;
                    self.reply(&format!("\r\n{BANNER}"));
                }
            }
            return;
        }

        self.rx_used += 1;
        transcript.max_rx_used = transcript.max_rx_used.max(self.rx_used);
        if self.rx_used > self.options.rx_buffer_size {
            transcript.overflowed = true;
        }

        if byte != b'\n' {
            self.partial.push(byte);
            return;
        }
        let line = String::from_utf8_lossy(&self.partial).trim().to_string();
        let size = self.partial.len() + 1;
        self.partial.clear();
        if !line.is_empty() {
            transcript.lines.push(line.clone());
        }
        if self.queue.is_empty() {
            self.next_ack_at = Instant::now() + self.options.line_delay;
        }
        self.queue.push_back((line, size));
    }

    fn can_consume(&self) -> bool {
        let Some((line, _)) = self.queue.front() else {
            return false;
        };
        let stalled = !line.is_empty() && self.options.stall_after.is_some_and(|n| self.handled >= n);
        !self.held && !stalled
    }

    fn consume(&mut self, now: Instant) {
        if !self.can_consume() || now < self.next_ack_at {
            return;
        }
        let Some((line, size)) = self.queue.pop_front() else {
            return;
        };
        self.rx_used -= size;
        self.next_ack_at = now + self.options.line_delay;

        if line.is_empty() {
            self.reply("ok");
            return;
        }
        let index = self.handled;
        self.handled += 1;
        match self.options.error_at {
            Some((at, code)) if at == index => self.reply(&format!("error:{code}")),
            _ => {
                self.track_position(&line);
                self.reply("ok");
            }
        }
    }

    fn track_position(&mut self, line: &str) {
        for word in line.split_whitespace().skip(1) {
            let mut chars = word.chars();
            let Some(letter) = chars.next() else { continue };
            let Some(axis) = self.options.axes.iter().position(|&a| a == letter) else {
                continue;
            };
            if let Ok(value) = chars.as_str().parse::<f64>() {
                self.position[axis] = value;
            }
        }
    }

    fn status(&self) -> String {
        let state = if self.held {
            "Hold:0"
        } else if self.queue.is_empty() {
            "Idle"
        } else {
            "Run"
        };
        let position: Vec<String> = self.position.iter().map(|p| format!("{p:.3}")).collect();
        format!("<{state}|MPos:{}|FS:0,0>", position.join(","))
    }
}

struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    timeout: Duration,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(self.timeout) {
                Ok(bytes) => self.pending.extend(bytes),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data from controller"));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

struct ChannelWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "controller is gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
