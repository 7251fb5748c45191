//! Per-client outbound command channel: a bounded queue drained by one
//! writer thread, with control commands overtaking queued bulk data.

use crate::comm::{Command, CommandError};
use log::warn;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

/// Destination of a channel's command stream.
pub trait CommandWriter: Send {
    fn write_cmd(&mut self, cmd: &Command) -> Result<(), CommandError>;
}

/// Binary length-framed output, used for remote clients.
pub struct FrameWriter<W: Write + Send>(pub W);

impl<W: Write + Send> CommandWriter for FrameWriter<W> {
    fn write_cmd(&mut self, cmd: &Command) -> Result<(), CommandError> {
        cmd.write_to(&mut self.0)
    }
}

/// Line-per-command human output, used for local script clients tracing
/// to the console or an output file.
pub struct TextWriter<W: Write + Send>(pub W);

impl<W: Write + Send> CommandWriter for TextWriter<W> {
    fn write_cmd(&mut self, cmd: &Command) -> Result<(), CommandError> {
        writeln!(self.0, "{cmd}")?;
        self.0.flush()?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("command channel is closed")]
pub struct ChannelClosed;

struct State {
    urgent: VecDeque<Command>,
    bulk: VecDeque<Command>,
    shutdown: bool,
    failed: bool,
}

struct Shared {
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
    limit: usize,
}

/// Outbound half of one client connection.
///
/// Urgent commands overtake every bulk command still queued; two bulk
/// commands keep their enqueue order. Bulk enqueueing blocks once the
/// queue holds `limit` entries, urgent enqueueing never does. On close,
/// queued commands are drained best-effort before the writer exits.
#[derive(Clone)]
pub struct CommandChannel {
    shared: Arc<Shared>,
}

impl CommandChannel {
    pub fn new(limit: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    urgent: VecDeque::new(),
                    bulk: VecDeque::new(),
                    shutdown: false,
                    failed: false,
                }),
                readable: Condvar::new(),
                writable: Condvar::new(),
                limit: limit.max(1),
            }),
        }
    }

    /// Start the single writer draining this channel into `sink`.
    pub fn spawn_writer(&self, sink: Box<dyn CommandWriter>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        thread::Builder::new()
            .name("twr-channel".to_string())
            .spawn(move || writer_loop(shared, sink))
            .expect("channel writer must start")
    }

    pub fn send(&self, cmd: Command) -> Result<(), ChannelClosed> {
        let mut state = self.lock();
        if state.shutdown || state.failed {
            return Err(ChannelClosed);
        }
        if cmd.is_urgent() {
            state.urgent.push_back(cmd);
        } else {
            while state.bulk.len() >= self.shared.limit {
                state = self
                    .shared
                    .writable
                    .wait(state)
                    .expect("channel lock poisoned");
                if state.shutdown || state.failed {
                    return Err(ChannelClosed);
                }
            }
            state.bulk.push_back(cmd);
        }
        self.shared.readable.notify_one();
        Ok(())
    }

    /// Stop accepting commands; the writer drains what is queued and
    /// exits.
    pub fn close(&self) {
        let mut state = self.lock();
        state.shutdown = true;
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        let state = self.lock();
        state.shutdown || state.failed
    }

    /// True when the writer died on an output error.
    pub fn is_failed(&self) -> bool {
        self.lock().failed
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().expect("channel lock poisoned")
    }
}

fn writer_loop(shared: Arc<Shared>, mut sink: Box<dyn CommandWriter>) {
    loop {
        let cmd = {
            let mut state = shared.state.lock().expect("channel lock poisoned");
            loop {
                if let Some(cmd) = state.urgent.pop_front() {
                    break Some(cmd);
                }
                if let Some(cmd) = state.bulk.pop_front() {
                    shared.writable.notify_one();
                    break Some(cmd);
                }
                if state.shutdown {
                    break None;
                }
                state = shared
                    .readable
                    .wait(state)
                    .expect("channel lock poisoned");
            }
        };
        let Some(cmd) = cmd else {
            return;
        };
        if let Err(e) = sink.write_cmd(&cmd) {
            warn!(target: "agent", "command channel write failed: {e}");
            let mut state = shared.state.lock().expect("channel lock poisoned");
            state.failed = true;
            state.shutdown = true;
            state.urgent.clear();
            state.bulk.clear();
            shared.writable.notify_all();
            return;
        }
    }
}
