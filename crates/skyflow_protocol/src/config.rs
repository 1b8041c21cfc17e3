//! Engine configuration shared by the supervisor and the CLI.

use std::path::PathBuf;
use std::time::Duration;

use crate::defaults::{
    CHUNK_SIZE, DEFAULT_EXPIRY_MARGIN_SECS, DEFAULT_MAX_FAILURES, DEFAULT_PHASE_WAIT_SECS,
    DEFAULT_POOL_SIZE, DEFAULT_RETRY_BACKOFF_SECS, DEFAULT_STALE_GRACE_SECS,
    DEFAULT_SYNC_TIMEOUT_SECS, MAX_OBJECTS,
};
use crate::paths::default_work_dir;

/// Canonical engine configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding checkpoints, execution logs, artifacts and caches
    pub work_dir: PathBuf,
    /// Worker threads executing pipeline runs
    pub pool_size: usize,
    /// Consecutive failures tolerated per job handle during retrieval
    pub max_failures: u32,
    /// Bounded wait of one job phase poll
    pub phase_wait: Duration,
    /// Base delay before retrying a failed transfer (doubled per failure)
    pub retry_backoff: Duration,
    /// Request timeout for synchronous catalog services
    pub sync_timeout: Duration,
    /// Remote jobs this close to destruction are resubmitted instead of reused
    pub expiry_margin: chrono::Duration,
    /// Inactivity after which session files are swept
    pub stale_grace: Duration,
    /// Row limit passed to catalog services
    pub max_objects: u64,
    /// Streaming chunk size
    pub chunk_size: usize,
    /// Use the per-step result cache
    pub use_cache: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            pool_size: DEFAULT_POOL_SIZE,
            max_failures: DEFAULT_MAX_FAILURES,
            phase_wait: Duration::from_secs(DEFAULT_PHASE_WAIT_SECS),
            retry_backoff: Duration::from_secs(DEFAULT_RETRY_BACKOFF_SECS),
            sync_timeout: Duration::from_secs(DEFAULT_SYNC_TIMEOUT_SECS),
            expiry_margin: chrono::Duration::seconds(DEFAULT_EXPIRY_MARGIN_SECS),
            stale_grace: Duration::from_secs(DEFAULT_STALE_GRACE_SECS),
            max_objects: MAX_OBJECTS,
            chunk_size: CHUNK_SIZE,
            use_cache: true,
        }
    }
}

impl EngineConfig {
    pub fn with_work_dir(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }
}
