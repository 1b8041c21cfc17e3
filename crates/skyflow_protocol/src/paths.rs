use std::path::{Path, PathBuf};

use crate::types::{SessionId, Step};

/// Resolve the SkyFlow home directory.
///
/// Priority:
/// 1) SKYFLOW_HOME
/// 2) HOME/USERPROFILE
/// 3) ./.skyflow
pub fn skyflow_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("SKYFLOW_HOME") {
        return PathBuf::from(override_path);
    }
    if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        return PathBuf::from(home).join(".skyflow");
    }
    PathBuf::from(".").join(".skyflow")
}

/// Default per-session work directory: ~/.skyflow/sessions
pub fn default_work_dir() -> PathBuf {
    skyflow_home().join("sessions")
}

/// Default density map directory: ~/.skyflow/hips
pub fn default_density_dir() -> PathBuf {
    skyflow_home().join("hips")
}

/// Default logs directory: ~/.skyflow/logs
pub fn default_logs_dir() -> PathBuf {
    skyflow_home().join("logs")
}

/// On-disk layout of one session's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFiles {
    pub checkpoint: PathBuf,
    pub execution_log: PathBuf,
    pub artifact: PathBuf,
    primary_cache: PathBuf,
    reference_cache: PathBuf,
}

impl SessionFiles {
    pub fn new(work_dir: &Path, session: &SessionId) -> Self {
        let base = format!("process_{}", session);
        Self {
            checkpoint: work_dir.join(format!("{}.json", base)),
            execution_log: work_dir.join(format!("{}.log", base)),
            artifact: work_dir.join(format!("{}.fits", base)),
            primary_cache: work_dir.join(format!("{}_cache1.parquet", base)),
            reference_cache: work_dir.join(format!("{}_cache2.parquet", base)),
        }
    }

    pub fn cache(&self, step: Step) -> &Path {
        match step {
            Step::Primary => &self.primary_cache,
            Step::Reference => &self.reference_cache,
        }
    }

    /// Files removed by a full abort (the per-step caches go with their steps)
    pub fn process_files(&self) -> [&Path; 3] {
        [&self.checkpoint, &self.execution_log, &self.artifact]
    }

    pub fn all(&self) -> [&Path; 5] {
        [
            &self.checkpoint,
            &self.execution_log,
            &self.artifact,
            &self.primary_cache,
            &self.reference_cache,
        ]
    }
}

/// Extract the session id from a session file name (`process_<id>...`).
pub fn session_from_file_name(name: &str) -> Option<SessionId> {
    let rest = name.strip_prefix("process_")?;
    let stem = rest.split('.').next().unwrap_or(rest);
    let candidate = stem
        .strip_suffix("_cache1")
        .or_else(|| stem.strip_suffix("_cache2"))
        .unwrap_or(stem);
    SessionId::parse(candidate).ok()
}
