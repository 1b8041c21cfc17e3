//! Command types for the progress-log core.
//!
//! Commands are sent from workers and control calls to the log thread.
//! Each command includes a Responder channel for returning results.

use skyflow_protocol::{ProcessLogEntry, SessionId};
use std::sync::mpsc::Sender;

use super::{AppendOutcome, LogError, RunId};

/// One-shot channel for returning results from the log core
pub type Responder<T> = Sender<T>;

/// Commands sent to the log thread
#[derive(Debug)]
pub enum Command {
    /// Start a fresh, empty log for a new run of the session
    Reset {
        session: SessionId,
        run: RunId,
        respond: Responder<()>,
    },

    /// Append an entry on behalf of a run
    Append {
        session: SessionId,
        run: RunId,
        entry: ProcessLogEntry,
        respond: Responder<Result<AppendOutcome, LogError>>,
    },

    /// Close the current run with an `abort` entry carrying the previous
    /// entry's time and percent
    Stop {
        session: SessionId,
        message: String,
        respond: Responder<Result<ProcessLogEntry, LogError>>,
    },

    /// Copy of the session's entries
    Snapshot {
        session: SessionId,
        respond: Responder<Option<(RunId, Vec<ProcessLogEntry>)>>,
    },

    /// Drop the session's log, returning its last entries
    Clear {
        session: SessionId,
        respond: Responder<Vec<ProcessLogEntry>>,
    },

    /// Request graceful shutdown
    Shutdown,
}
