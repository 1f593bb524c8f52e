// Send-ahead flow control.
//
// The writer may only send a line when it fits in what is left of the
// controller's receive buffer; each `ok` frees the bytes of the oldest
// outstanding line. Writer, reader and status poller all block on the same
// condition variable, so cancelling, finishing or failing wakes every one of
// them at once.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::StreamError;

/// How a blocking wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    Ready,
    Cancelled,
}

/// A line sent but not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct Pending {
    pub line: String,
    /// Index into the song, `None` for set-up lines.
    pub command: Option<usize>,
    /// Axis index and absolute position reached once the line is accepted.
    pub targets: Vec<(usize, f64)>,
    len: usize,
}

#[derive(Debug)]
struct FlowState {
    in_flight: usize,
    pending: VecDeque<Pending>,
    last_progress: Instant,
    cancelled: bool,
    finished: bool,
    failed: bool,
    fault: Option<StreamError>,
}

impl FlowState {
    fn stopped(&self) -> bool {
        self.cancelled || self.finished || self.failed
    }
}

#[derive(Debug)]
pub struct FlowControl {
    capacity: usize,
    state: Mutex<FlowState>,
    changed: Condvar,
}

impl FlowControl {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(FlowState {
                in_flight: 0,
                pending: VecDeque::new(),
                last_progress: Instant::now(),
                cancelled: false,
                finished: false,
                failed: false,
                fault: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Stops the helper threads after a normal end of session.
    pub fn finish(&self) {
        self.state.lock().finished = true;
        self.changed.notify_all();
    }

    /// True once the session is over for any reason.
    pub fn is_stopped(&self) -> bool {
        let state = self.state.lock();
        state.stopped()
    }

    /// Records the first error seen by any thread and wakes the others.
    pub fn fail(&self, err: StreamError) {
        let mut state = self.state.lock();
        if !state.failed {
            state.failed = true;
            state.fault = Some(err);
        }
        drop(state);
        self.changed.notify_all();
    }

    pub fn take_fault(&self) -> Option<StreamError> {
        self.state.lock().fault.take()
    }

    /// Blocks until `line` plus its terminator fits in the receive buffer,
    /// then books it as in flight. Fails when no acknowledgment arrives for
    /// `window` while waiting.
    pub fn reserve(
        &self,
        line: &str,
        command: Option<usize>,
        targets: Vec<(usize, f64)>,
        window: Duration,
    ) -> Result<Wait, StreamError> {
        let len = line.len() + 1;
        if len > self.capacity {
            return Err(StreamError::LineTooLong {
                command,
                len,
                capacity: self.capacity,
            });
        }

        let mut state = self.state.lock();
        if state.pending.is_empty() {
            state.last_progress = Instant::now();
        }
        loop {
            if state.cancelled {
                return Ok(Wait::Cancelled);
            }
            if let Some(err) = state.fault.take() {
                return Err(err);
            }
            if state.in_flight + len <= self.capacity {
                break;
            }
            let deadline = state.last_progress + window;
            if self.changed.wait_until(&mut state, deadline).timed_out() && Instant::now() >= deadline {
                return Err(Self::timeout(&state, window));
            }
        }

        state.in_flight += len;
        state.pending.push_back(Pending {
            line: line.to_string(),
            command,
            targets,
            len,
        });
        Ok(Wait::Ready)
    }

    /// Releases the oldest outstanding line. `None` if nothing was pending.
    pub fn acknowledge(&self) -> Option<Pending> {
        let mut state = self.state.lock();
        let acked = state.pending.pop_front()?;
        state.in_flight -= acked.len;
        state.last_progress = Instant::now();
        drop(state);
        self.changed.notify_all();
        Some(acked)
    }

    /// The line the controller is answering next.
    pub fn oldest(&self) -> Option<Pending> {
        self.state.lock().pending.front().cloned()
    }

    /// Blocks until every sent line has been acknowledged.
    pub fn drain(&self, window: Duration) -> Result<Wait, StreamError> {
        let mut state = self.state.lock();
        state.last_progress = Instant::now();
        loop {
            if state.cancelled {
                return Ok(Wait::Cancelled);
            }
            if let Some(err) = state.fault.take() {
                return Err(err);
            }
            if state.pending.is_empty() {
                return Ok(Wait::Ready);
            }
            let deadline = state.last_progress + window;
            if self.changed.wait_until(&mut state, deadline).timed_out() && Instant::now() >= deadline {
                return Err(Self::timeout(&state, window));
            }
        }
    }

    /// Sleeps for `duration` unless the session stops first. Returns false
    /// when it stopped.
    pub fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.state.lock();
        loop {
            if state.stopped() {
                return false;
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return !state.stopped();
            }
        }
    }

    fn timeout(state: &FlowState, window: Duration) -> StreamError {
        let oldest = state.pending.front();
        StreamError::AckTimeout {
            command: oldest.and_then(|p| p.command),
            line: oldest.map(|p| p.line.clone()).unwrap_or_default(),
            waited: window,
        }
    }
}
