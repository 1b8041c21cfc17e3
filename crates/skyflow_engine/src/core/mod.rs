//! Progress-log core: single-owner state for every session's run log.
//!
//! The log thread exclusively owns the entries. Workers append and control
//! calls stop, snapshot or clear by sending Commands; readers only ever see
//! copies. The core also enforces the two rules cancellation relies on: a
//! log accepts nothing after a terminal entry, and a superseded run cannot
//! append to its successor's log.

mod command;

pub use command::{Command, Responder};

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use skyflow_protocol::{ProcessLogEntry, ProcessState, SessionId};
use thiserror::Error;
use tracing::{debug, info};

/// Generation number of a pipeline run, unique within a supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub u64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("No run is logged for session {0}")]
    NoRun(SessionId),

    #[error("{run} was superseded by {current}")]
    Superseded { run: RunId, current: RunId },

    #[error("The run already ended with state {0}")]
    Closed(ProcessState),

    #[error("The progress log is not running")]
    Unavailable,
}

/// How an accepted entry was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Replaced the previous percentage entry
    Replaced,
}

/// Append `entry` under the log rules: nothing after a terminal entry, and
/// consecutive percentage entries collapse into the latest.
pub fn apply_append(
    entries: &mut Vec<ProcessLogEntry>,
    entry: ProcessLogEntry,
) -> Result<AppendOutcome, LogError> {
    match entries.last_mut() {
        Some(last) if last.state.is_terminal() => Err(LogError::Closed(last.state)),
        Some(last) if last.is_progress() && entry.is_progress() => {
            *last = entry;
            Ok(AppendOutcome::Replaced)
        }
        _ => {
            entries.push(entry);
            Ok(AppendOutcome::Appended)
        }
    }
}

#[derive(Debug)]
struct SessionLog {
    run: RunId,
    entries: Vec<ProcessLogEntry>,
}

/// Handle for interacting with the log core from other threads.
///
/// Can be cloned and shared. All operations send Commands to the core
/// and wait for responses via one-shot channels.
#[derive(Clone)]
pub struct LogHandle {
    cmd_tx: Sender<Command>,
}

impl LogHandle {
    fn new(cmd_tx: Sender<Command>) -> Self {
        Self { cmd_tx }
    }

    /// Send a command and wait for response
    fn send_and_wait<T>(&self, make_cmd: impl FnOnce(Responder<T>) -> Command) -> Result<T, LogError>
    where
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        self.cmd_tx
            .send(make_cmd(tx))
            .map_err(|_| LogError::Unavailable)?;
        rx.recv().map_err(|_| LogError::Unavailable)
    }

    pub fn reset(&self, session: &SessionId, run: RunId) -> Result<(), LogError> {
        self.send_and_wait(|respond| Command::Reset {
            session: session.clone(),
            run,
            respond,
        })
    }

    pub fn append(
        &self,
        session: &SessionId,
        run: RunId,
        entry: ProcessLogEntry,
    ) -> Result<AppendOutcome, LogError> {
        self.send_and_wait(|respond| Command::Append {
            session: session.clone(),
            run,
            entry,
            respond,
        })?
    }

    /// Close the session's current run with an `abort` entry.
    pub fn stop(&self, session: &SessionId, message: &str) -> Result<ProcessLogEntry, LogError> {
        self.send_and_wait(|respond| Command::Stop {
            session: session.clone(),
            message: message.to_string(),
            respond,
        })?
    }

    /// Entries of the session's log, empty when there is none.
    pub fn snapshot(&self, session: &SessionId) -> Result<Vec<ProcessLogEntry>, LogError> {
        Ok(self
            .current(session)?
            .map(|(_, entries)| entries)
            .unwrap_or_default())
    }

    /// Run owning the session's log and its entries.
    pub fn current(
        &self,
        session: &SessionId,
    ) -> Result<Option<(RunId, Vec<ProcessLogEntry>)>, LogError> {
        self.send_and_wait(|respond| Command::Snapshot {
            session: session.clone(),
            respond,
        })
    }

    pub fn clear(&self, session: &SessionId) -> Result<Vec<ProcessLogEntry>, LogError> {
        self.send_and_wait(|respond| Command::Clear {
            session: session.clone(),
            respond,
        })
    }

    /// Request shutdown
    pub fn shutdown(&self) -> Result<(), LogError> {
        self.cmd_tx
            .send(Command::Shutdown)
            .map_err(|_| LogError::Unavailable)
    }
}

impl fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandle")
            .field("cmd_tx", &"<Sender>")
            .finish()
    }
}

/// Log core - owns every session's entries and processes Commands in a
/// synchronous loop.
pub struct LogCore {
    logs: HashMap<SessionId, SessionLog>,
    commands: Receiver<Command>,
}

impl LogCore {
    /// Create a new core and its handle. Run the core in its own thread via `run()`.
    pub fn new() -> (Self, LogHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let core = Self {
            logs: HashMap::new(),
            commands: cmd_rx,
        };
        (core, LogHandle::new(cmd_tx))
    }

    /// Run the core loop. Blocks until shutdown.
    pub fn run(&mut self) {
        debug!("Progress log started");
        loop {
            match self.commands.recv() {
                Ok(Command::Shutdown) => {
                    debug!("Progress log received shutdown command");
                    break;
                }
                Ok(cmd) => self.handle_command(cmd),
                Err(_) => {
                    debug!("Progress log command channel closed");
                    break;
                }
            }
        }
        debug!("Progress log stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Reset {
                session,
                run,
                respond,
            } => {
                self.logs.insert(
                    session,
                    SessionLog {
                        run,
                        entries: Vec::new(),
                    },
                );
                let _ = respond.send(());
            }

            Command::Append {
                session,
                run,
                entry,
                respond,
            } => {
                let result = self.append(&session, run, entry);
                let _ = respond.send(result);
            }

            Command::Stop {
                session,
                message,
                respond,
            } => {
                let result = self.stop(&session, message);
                let _ = respond.send(result);
            }

            Command::Snapshot { session, respond } => {
                let snapshot = self
                    .logs
                    .get(&session)
                    .map(|log| (log.run, log.entries.clone()));
                let _ = respond.send(snapshot);
            }

            Command::Clear { session, respond } => {
                let entries = self
                    .logs
                    .remove(&session)
                    .map(|log| log.entries)
                    .unwrap_or_default();
                let _ = respond.send(entries);
            }

            Command::Shutdown => {
                // Handled in main loop
            }
        }
    }

    fn append(
        &mut self,
        session: &SessionId,
        run: RunId,
        entry: ProcessLogEntry,
    ) -> Result<AppendOutcome, LogError> {
        let log = self
            .logs
            .get_mut(session)
            .ok_or_else(|| LogError::NoRun(session.clone()))?;
        if log.run != run {
            return Err(LogError::Superseded {
                run,
                current: log.run,
            });
        }
        apply_append(&mut log.entries, entry)
    }

    fn stop(&mut self, session: &SessionId, message: String) -> Result<ProcessLogEntry, LogError> {
        let log = self
            .logs
            .get_mut(session)
            .ok_or_else(|| LogError::NoRun(session.clone()))?;
        let (time, percent) = log
            .entries
            .last()
            .map_or((0.0, 0), |last| (last.time, last.percent));
        let entry = ProcessLogEntry::new(time, ProcessState::Abort, percent, message);
        apply_append(&mut log.entries, entry.clone())?;
        info!("Closed {} of session {} with abort", log.run, session);
        Ok(entry)
    }
}

/// Spawn the log core in a dedicated thread
pub fn spawn_log_core() -> std::io::Result<(LogHandle, JoinHandle<()>)> {
    let (mut core, handle) = LogCore::new();
    let thread_handle = thread::Builder::new()
        .name("skyflow-log".to_string())
        .spawn(move || {
            core.run();
        })?;
    Ok((handle, thread_handle))
}
