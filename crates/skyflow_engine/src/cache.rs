//! Per-(session, step) result cache as Parquet files.
//!
//! A cache file is only ever written for the fingerprint currently
//! registered for its step; the registry removes it whenever that
//! registration changes, so presence alone means "valid".

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use arrow::compute::concat_batches;
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use skyflow_protocol::{SessionFiles, SessionId, Step};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::table::Table;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cache file error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("Cache data error: {0}")]
    Arrow(#[from] ArrowError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Counters for cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub writes: u64,
}

pub struct ResultCache {
    work_dir: PathBuf,
    enabled: bool,
    hits: AtomicU64,
    writes: AtomicU64,
}

impl ResultCache {
    pub fn new(work_dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            work_dir: work_dir.into(),
            enabled,
            hits: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    pub fn path(&self, session: &SessionId, step: Step) -> PathBuf {
        SessionFiles::new(&self.work_dir, session)
            .cache(step)
            .to_path_buf()
    }

    pub fn contains(&self, session: &SessionId, step: Step) -> bool {
        self.enabled && self.path(session, step).is_file()
    }

    /// Cached table of a step, if any.
    pub fn load(&self, session: &SessionId, step: Step) -> Result<Option<Table>, CacheError> {
        if !self.enabled {
            return Ok(None);
        }
        let path = self.path(session, step);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let schema = builder.schema().clone();
        let batches = builder.build()?.collect::<Result<Vec<RecordBatch>, ArrowError>>()?;
        let table = if batches.is_empty() {
            RecordBatch::new_empty(schema)
        } else {
            concat_batches(&schema, &batches)?
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Cache hit for session {} step {}: {} rows",
            session,
            step.number(),
            table.num_rows()
        );
        Ok(Some(table))
    }

    /// Persist a step's table, replacing any previous file atomically.
    pub fn store(
        &self,
        session: &SessionId,
        step: Step,
        table: &Table,
    ) -> Result<Option<PathBuf>, CacheError> {
        if !self.enabled {
            return Ok(None);
        }
        let path = self.path(session, step);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let tmp = path.with_extension("parquet.tmp");
        let file = File::create(&tmp).map_err(io_error(&tmp))?;
        let mut writer = ArrowWriter::try_new(file, table.schema(), None)?;
        writer.write(table)?;
        writer.close()?;
        fs::rename(&tmp, &path).map_err(io_error(&path))?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        info!(
            "Cached {} rows for session {} step {}",
            table.num_rows(),
            session,
            step.number()
        );
        Ok(Some(path))
    }

    /// Remove a step's cache file. Returns whether one existed.
    pub fn invalidate(&self, session: &SessionId, step: Step) -> bool {
        let path = self.path(session, step);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed cache {}", path.display());
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!("Cannot remove cache {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Copy one step's cache file to the other step.
    pub fn copy(&self, session: &SessionId, from: Step, to: Step) -> Result<bool, CacheError> {
        let source = self.path(session, from);
        if !self.enabled || !source.is_file() {
            return Ok(false);
        }
        let target = self.path(session, to);
        fs::copy(&source, &target).map_err(io_error(&target))?;
        Ok(true)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }
}
