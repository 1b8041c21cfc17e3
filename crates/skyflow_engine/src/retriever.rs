//! Streaming retrieval of a step's results with retries and progress.

use std::sync::Arc;
use std::time::Duration;

use skyflow_protocol::defaults::MAX_METADATA_VALUE_LEN;
use skyflow_protocol::{progress_message, JobHandle, SessionId, Step};
use tracing::{info, warn};

use crate::cache::ResultCache;
use crate::cancel::{CancellationToken, Cancelled};
use crate::catalog::CatalogClient;
use crate::error::{CatalogError, RetrieveError};
use crate::table::{self, Table};

/// Longest delay between two attempts on the same handle
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Receiver of the retriever's human-readable progress.
///
/// Returning `Err(Cancelled)` stops the retrieval; the progress log does
/// so once the run has been stopped or superseded.
pub trait ProgressSink {
    fn report(&self, message: &str) -> Result<(), Cancelled>;

    /// Move the coarse stage progress carried by later entries.
    fn set_percent(&self, _percent: u8) {}
}

pub struct Retriever {
    catalog: Arc<CatalogClient>,
    cache: Arc<ResultCache>,
    max_failures: u32,
    backoff: Duration,
}

impl Retriever {
    pub fn new(
        catalog: Arc<CatalogClient>,
        cache: Arc<ResultCache>,
        max_failures: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            catalog,
            cache,
            max_failures: max_failures.max(1),
            backoff,
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Table of one step: from the cache when present, otherwise fetched
    /// from every handle, stacked, and cached.
    pub fn retrieve(
        &self,
        session: &SessionId,
        step: Step,
        handles: &[JobHandle],
        expected_records: Option<u64>,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Table, RetrieveError> {
        cancel.check()?;
        if let Some(table) = self.cache.load(session, step)? {
            sink.report("Using cached results")?;
            return Ok(table);
        }
        if handles.is_empty() {
            return Err(RetrieveError::NoJobs { step });
        }

        let mut tables = Vec::with_capacity(handles.len());
        for handle in handles {
            cancel.check()?;
            tables.push(self.fetch_with_retry(handle, expected_records, sink, cancel)?);
        }
        let combined = table::stack(tables)?;
        let combined = table::strip_long_metadata(combined, MAX_METADATA_VALUE_LEN)?;
        cancel.check()?;
        self.cache.store(session, step, &combined)?;
        // A query change may have dropped the step's cache meanwhile
        if cancel.is_cancelled() {
            self.cache.invalidate(session, step);
            return Err(RetrieveError::Cancelled);
        }
        Ok(combined)
    }

    fn fetch_with_retry(
        &self,
        handle: &JobHandle,
        expected_records: Option<u64>,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<Table, RetrieveError> {
        let mut failures = 0u32;
        loop {
            sink.report(&format!("Retrieving data from {}", handle.describe()))?;
            let mut on_progress =
                |percent: f64| sink.report(&progress_message("Downloading", percent));
            let err = match self
                .catalog
                .fetch(handle, expected_records, &mut on_progress, cancel)
            {
                Ok(table) => {
                    info!("Retrieved {} rows from {}", table.num_rows(), handle.describe());
                    return Ok(table);
                }
                Err(CatalogError::Cancelled) => return Err(RetrieveError::Cancelled),
                Err(err) if !err.is_transient() => {
                    warn!("Giving up on {}: {}", handle.describe(), err);
                    sink.report(&format!("Cannot retrieve the data: {}", err))?;
                    return Err(err.into());
                }
                Err(err) => err,
            };

            failures += 1;
            if failures >= self.max_failures {
                warn!(
                    "Giving up on {} after {} failures: {}",
                    handle.describe(),
                    failures,
                    err
                );
                sink.report(&format!(
                    "Cannot retrieve the data after {} tries: giving up",
                    failures
                ))?;
                return Err(err.into());
            }

            match &err {
                CatalogError::Pending { phase } => {
                    sink.report(&format!("Job still in phase {}: trying again", phase))?;
                }
                other => {
                    warn!("Attempt {} on {} failed: {}", failures, handle.describe(), other);
                    sink.report(&other.to_string())?;
                    cancel.sleep(self.delay(failures))?;
                }
            }
        }
    }

    /// Exponential backoff after the n-th consecutive failure.
    fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retriever = Retriever {
            catalog: Arc::new(CatalogClient::new(
                Arc::new(NoBackends),
                &skyflow_protocol::EngineConfig::with_work_dir("/tmp/unused"),
            )),
            cache: Arc::new(ResultCache::new("/tmp/unused", false)),
            max_failures: 5,
            backoff: Duration::from_secs(2),
        };
        assert_eq!(retriever.delay(1), Duration::from_secs(2));
        assert_eq!(retriever.delay(3), Duration::from_secs(8));
        assert_eq!(retriever.delay(30), MAX_BACKOFF);
    }

    struct NoBackends;

    impl crate::catalog::Connector for NoBackends {
        fn remote_async(
            &self,
            _url: &str,
        ) -> Result<Arc<dyn crate::catalog::AsyncJobService>, CatalogError> {
            Err(CatalogError::Transport("offline".into()))
        }
        fn remote_sync(
            &self,
            _url: &str,
        ) -> Result<Arc<dyn crate::catalog::SyncQueryService>, CatalogError> {
            Err(CatalogError::Transport("offline".into()))
        }
        fn local(
            &self,
            _database: &str,
        ) -> Result<Arc<dyn crate::catalog::LocalQueryEngine>, CatalogError> {
            Err(CatalogError::Transport("offline".into()))
        }
    }
}
