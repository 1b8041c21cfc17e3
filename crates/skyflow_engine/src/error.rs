//! Error types of the orchestration engine, one enum per layer.

use skyflow_protocol::{SessionId, Step};
use thiserror::Error;

use crate::cache::CacheError;
use crate::cancel::Cancelled;
use crate::catalog::query::QueryError;
use crate::raster::RasterError;
use crate::table::TableError;

/// Failures talking to a catalog backend.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Connection, timeout or server-side (5xx) failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The service answered but refused the request (4xx)
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The remote job has not finished yet
    #[error("Job still in phase {phase}")]
    Pending { phase: String },

    /// The remote job ended without results (ERROR, ABORTED or unknown phase)
    #[error("Unexpected job phase {phase}")]
    JobFailed { phase: String },

    #[error("Cannot decode result: {0}")]
    Decode(#[from] TableError),

    #[error("Local query failed: {0}")]
    Local(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("Backend {backend} cannot run this query: {reason}")]
    Unsupported { backend: String, reason: String },

    #[error("Cancelled")]
    Cancelled,
}

impl CatalogError {
    /// Retrying may succeed: pending jobs, transport and decode failures.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CatalogError::Transport(_) | CatalogError::Pending { .. } | CatalogError::Decode(_)
        )
    }
}

impl From<Cancelled> for CatalogError {
    fn from(_: Cancelled) -> Self {
        CatalogError::Cancelled
    }
}

impl From<rusqlite::Error> for CatalogError {
    fn from(err: rusqlite::Error) -> Self {
        CatalogError::Local(err.to_string())
    }
}

/// Failures of the streaming retriever for one step.
#[derive(Debug, Error)]
pub enum RetrieveError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Results cannot be stacked: expected columns [{expected}], found [{found}]")]
    SchemaMismatch { expected: String, found: String },

    #[error("No jobs were registered for the {}", .step.label())]
    NoJobs { step: Step },

    #[error("Cannot combine results: {0}")]
    Table(TableError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Cancelled")]
    Cancelled,
}

impl From<Cancelled> for RetrieveError {
    fn from(_: Cancelled) -> Self {
        RetrieveError::Cancelled
    }
}

impl From<TableError> for RetrieveError {
    fn from(err: TableError) -> Self {
        match err {
            TableError::SchemaMismatch { expected, found } => {
                RetrieveError::SchemaMismatch { expected, found }
            }
            other => RetrieveError::Table(other),
        }
    }
}

/// Failures of one pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Retrieve(#[from] RetrieveError),

    #[error("Stage '{stage}' failed: {source:#}")]
    Stage {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error(transparent)]
    Artifact(#[from] RasterError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid checkpoint: {0}")]
    Checkpoint(#[from] serde_json::Error),

    /// A stage panicked; carries the panic message
    #[error("{0}")]
    Panic(String),

    #[error("Cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Stable name used in the terminal `error` log entry.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Retrieve(RetrieveError::SchemaMismatch { .. }) => "SchemaMismatch",
            PipelineError::Retrieve(RetrieveError::Catalog(_)) => "CatalogError",
            PipelineError::Retrieve(RetrieveError::Cache(_)) => "CacheError",
            PipelineError::Retrieve(_) => "RetrieveError",
            PipelineError::Stage { .. } => "StageError",
            PipelineError::MissingInput(_) => "MissingInput",
            PipelineError::Artifact(_) => "ArtifactError",
            PipelineError::Io(_) => "IOError",
            PipelineError::Checkpoint(_) => "CheckpointError",
            PipelineError::Panic(_) => "Panic",
            PipelineError::Cancelled => "Cancelled",
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled | PipelineError::Retrieve(RetrieveError::Cancelled)
        )
    }
}

impl From<Cancelled> for PipelineError {
    fn from(_: Cancelled) -> Self {
        PipelineError::Cancelled
    }
}

/// Failures of a control-plane call, rendered as an error `ControlMessage`.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Could not find running process for session ID {session}")]
    NotRunning { session: SessionId },

    #[error("Could not find any process for session ID {session}")]
    NoProcess { session: SessionId },

    #[error("No pipeline parameters were given or saved for session ID {session}")]
    NoParameters { session: SessionId },

    #[error("Unknown artifact {0}")]
    UnknownArtifact(String),

    #[error("Artifact has no plane {0}")]
    MissingPlane(String),

    #[error(transparent)]
    Artifact(#[from] RasterError),

    #[error("The worker pool is shut down")]
    PoolClosed,

    #[error("Catalog backend unavailable: {0}")]
    Backend(#[from] CatalogError),

    #[error("The progress log is unavailable")]
    LogUnavailable,

    #[error("Invalid checkpoint: {0}")]
    Checkpoint(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CatalogError::Transport("timed out".into()).is_transient());
        assert!(CatalogError::Pending {
            phase: "EXECUTING".into()
        }
        .is_transient());
        assert!(!CatalogError::JobFailed {
            phase: "ERROR".into()
        }
        .is_transient());
        assert!(!CatalogError::Rejected("400".into()).is_transient());
        assert!(!CatalogError::Cancelled.is_transient());
    }

    #[test]
    fn test_pending_message() {
        let err = CatalogError::Pending {
            phase: "QUEUED".into(),
        };
        assert_eq!(err.to_string(), "Job still in phase QUEUED");
    }

    #[test]
    fn test_schema_mismatch_is_lifted() {
        let err: RetrieveError = TableError::SchemaMismatch {
            expected: "ra:Float64".into(),
            found: "ra:Utf8".into(),
        }
        .into();
        let err = PipelineError::from(err);
        assert_eq!(err.kind(), "SchemaMismatch");
        assert!(!err.is_cancellation());
    }

    #[test]
    fn test_cancellation_kinds() {
        assert!(PipelineError::from(Cancelled).is_cancellation());
        assert!(PipelineError::from(RetrieveError::from(Cancelled)).is_cancellation());
    }
}
