//! Shared data model of the SkyFlow orchestration engine.
//!
//! Everything that crosses a component boundary lives here: session and step
//! identifiers, query fingerprints, job handles, the progress log entry, the
//! pipeline checkpoint, control-plane replies, and the engine configuration.

pub mod config;
pub mod defaults;
pub mod idempotency;
pub mod messages;
pub mod paths;
pub mod types;

pub use config::EngineConfig;
pub use idempotency::fingerprint_key;
pub use messages::{AreaReply, ControlMessage, ControlReply, ControlStatus, MonitorReply};
pub use paths::SessionFiles;
pub use types::{
    progress_message, BackendId, BackendKind, Checkpoint, Constraints, CoordColumns, Frame,
    JobHandle, MapGeometry, PipelineParams, ProcessLogEntry, ProcessState, QueryFingerprint,
    SessionId, SessionIdError, Step, SyncPayload,
};
