//! Canonical default values shared by the engine and the CLI.

/// Worker threads executing pipeline runs across all sessions
pub const DEFAULT_POOL_SIZE: usize = 2;

/// Consecutive retrieval failures tolerated per job handle
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Bounded wait for one job phase poll (seconds)
pub const DEFAULT_PHASE_WAIT_SECS: u64 = 120;

/// Base retry delay after a transport failure (seconds)
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 2;

/// Request timeout for synchronous catalog services (seconds)
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 600;

/// Remote jobs this close to their destruction time are resubmitted (seconds)
pub const DEFAULT_EXPIRY_MARGIN_SECS: i64 = 600;

/// Session files untouched for this long are swept (seconds)
pub const DEFAULT_STALE_GRACE_SECS: u64 = 8 * 60 * 60;

/// Maximum number of records requested from a catalog
pub const MAX_OBJECTS: u64 = 10_000_000;

/// Estimated objects below which an area is too small to map
pub const MIN_AREA_OBJECTS: f64 = 500.0;

/// Estimated objects above which an area is refused
pub const MAX_AREA_OBJECTS: f64 = 1.0e7;

/// Streaming chunk size for result downloads
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Schema metadata values longer than this are dropped before caching
pub const MAX_METADATA_VALUE_LEN: usize = 256;

/// Marker of replaceable percentage messages in the progress log
pub const PROGRESS_PREFIX: &str = "\u{25b8} ";

/// Rows requested when probing a catalog
pub const PROBE_ROWS: u64 = 3;

pub const STOPPED_MESSAGE_PREFIX: &str = "Stopping process for session ID";
