//! Catalog client: one interface over three kinds of query backends.
//!
//! - remote-async: TAP-like job services (submit, run, poll phase, fetch, delete)
//! - remote-sync: catalog form services answering each request directly
//! - local: an embedded SQLite database with one table per catalog
//!
//! Backends are reached through a [`Connector`], so the engine can be driven
//! by scripted services in tests.

pub mod local;
pub mod query;
pub mod tap;
pub mod vizier;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use skyflow_protocol::defaults::PROBE_ROWS;
use skyflow_protocol::{
    BackendId, BackendKind, Constraints, ControlMessage, EngineConfig, JobHandle,
    QueryFingerprint, SyncPayload,
};
use tracing::{debug, info, warn};

use crate::cancel::{CancellationToken, Cancelled};
use crate::error::CatalogError;
use crate::progress::{ProgressEstimator, RUNNING_CEILING};
use crate::table::{self, Table, TableError};

use self::query::{adql_select, condition_expression, condition_map, sql_select, Condition};

/// Streamed response body
pub type ResultStream = Box<dyn Read + Send>;

/// Phase of a server-side job, as far as retrieval is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPhase {
    /// Queued or executing; carries the raw phase name
    Pending(String),
    Completed,
    /// Error, aborted or an unknown phase
    Failed(String),
}

impl JobPhase {
    /// Classify a UWS phase name.
    pub fn classify(raw: &str) -> JobPhase {
        let phase = raw.trim().to_ascii_uppercase();
        match phase.as_str() {
            "COMPLETED" => JobPhase::Completed,
            "PENDING" | "QUEUED" | "EXECUTING" | "HELD" | "SUSPENDED" => JobPhase::Pending(phase),
            _ => JobPhase::Failed(phase),
        }
    }
}

/// A freshly created and started server-side job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub locator: String,
    pub destruction: Option<DateTime<Utc>>,
}

/// Remote service with a server-side job lifecycle.
pub trait AsyncJobService: Send + Sync {
    /// Create and start a job; returns its locator.
    fn submit(&self, query: &str, max_records: u64) -> Result<SubmittedJob, CatalogError>;

    /// Current phase, waiting at most `timeout` for the job to leave an
    /// executing phase.
    fn wait_phase(&self, locator: &str, timeout: Duration) -> Result<JobPhase, CatalogError>;

    fn open_result(&self, locator: &str) -> Result<ResultStream, CatalogError>;

    fn delete(&self, locator: &str) -> Result<(), CatalogError>;

    /// Run a small query synchronously (service checks).
    fn search(&self, query: &str, max_records: u64) -> Result<ResultStream, CatalogError>;
}

/// Remote service answering each request directly.
pub trait SyncQueryService: Send + Sync {
    fn request(&self, payload: &SyncPayload) -> Result<ResultStream, CatalogError>;
}

/// Embedded query engine over a local database.
pub trait LocalQueryEngine: Send + Sync {
    fn execute(&self, sql: &str) -> Result<Table, CatalogError>;
}

/// Resolves backend addresses to service implementations.
pub trait Connector: Send + Sync {
    fn remote_async(&self, url: &str) -> Result<Arc<dyn AsyncJobService>, CatalogError>;
    fn remote_sync(&self, url: &str) -> Result<Arc<dyn SyncQueryService>, CatalogError>;
    fn local(&self, database: &str) -> Result<Arc<dyn LocalQueryEngine>, CatalogError>;
}

/// Connector for the bundled HTTP and SQLite backends.
pub struct DefaultConnector {
    client: reqwest::blocking::Client,
    phase_wait: Duration,
    sync_timeout: Duration,
}

impl DefaultConnector {
    pub fn new(config: &EngineConfig) -> Result<Self, CatalogError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("skyflow/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CatalogError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            phase_wait: config.phase_wait,
            sync_timeout: config.sync_timeout,
        })
    }
}

impl Connector for DefaultConnector {
    fn remote_async(&self, url: &str) -> Result<Arc<dyn AsyncJobService>, CatalogError> {
        Ok(Arc::new(tap::TapService::new(
            self.client.clone(),
            url,
            self.phase_wait,
            self.sync_timeout,
        )))
    }

    fn remote_sync(&self, _url: &str) -> Result<Arc<dyn SyncQueryService>, CatalogError> {
        Ok(Arc::new(vizier::VizierService::new(
            self.client.clone(),
            self.sync_timeout,
        )))
    }

    fn local(&self, database: &str) -> Result<Arc<dyn LocalQueryEngine>, CatalogError> {
        Ok(Arc::new(local::SqliteEngine::open(database)?))
    }
}

/// Uniform submit/fetch/cancel over the three backends.
pub struct CatalogClient {
    connector: Arc<dyn Connector>,
    max_objects: u64,
    phase_wait: Duration,
    chunk_size: usize,
}

impl CatalogClient {
    pub fn new(connector: Arc<dyn Connector>, config: &EngineConfig) -> Self {
        Self {
            connector,
            max_objects: config.max_objects,
            phase_wait: config.phase_wait,
            chunk_size: config.chunk_size.max(1),
        }
    }

    /// Create one job per catalog. All or nothing: jobs created before a
    /// failure are cancelled again.
    pub fn submit(&self, fingerprint: &QueryFingerprint) -> Result<Vec<JobHandle>, CatalogError> {
        let mut handles = Vec::with_capacity(fingerprint.catalogs.len());
        for catalog in &fingerprint.catalogs {
            match self.submit_one(fingerprint, catalog) {
                Ok(handle) => {
                    debug!("Submitted {} for catalog {}", handle.describe(), catalog);
                    handles.push(handle);
                }
                Err(err) => {
                    for handle in &handles {
                        if let Err(e) = self.cancel(handle) {
                            warn!("Cannot release {}: {}", handle.describe(), e);
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(handles)
    }

    fn submit_one(
        &self,
        fingerprint: &QueryFingerprint,
        catalog: &str,
    ) -> Result<JobHandle, CatalogError> {
        match (&fingerprint.backend, &fingerprint.constraints) {
            (BackendId::RemoteAsync { url }, constraints) => {
                let filter = match constraints {
                    Constraints::Expression(expression) => expression.clone(),
                    Constraints::Columns(map) => query::columns_to_sql(map),
                };
                let adql = adql_select(catalog, &fingerprint.fields, Some(&filter), None);
                let service = self.connector.remote_async(url)?;
                let job = service.submit(&adql, self.max_objects)?;
                Ok(JobHandle::RemoteAsync {
                    service: url.clone(),
                    locator: job.locator,
                    destruction: job.destruction,
                })
            }
            (BackendId::RemoteSync { url }, Constraints::Columns(map)) => Ok(JobHandle::RemoteSync {
                payload: SyncPayload {
                    url: url.clone(),
                    source: catalog.to_string(),
                    columns: fingerprint.fields.clone(),
                    constraints: map.clone(),
                    row_limit: self.max_objects,
                },
            }),
            (BackendId::RemoteSync { .. }, Constraints::Expression(expression)) => {
                if expression.trim().is_empty() {
                    let empty = QueryFingerprint {
                        constraints: Constraints::Columns(Default::default()),
                        ..fingerprint.clone()
                    };
                    self.submit_one(&empty, catalog)
                } else {
                    let kind = BackendKind::RemoteSync.as_str();
                    Err(query::QueryError::ExpressionUnsupported(kind).into())
                }
            }
            (BackendId::Local { database }, constraints) => Ok(JobHandle::Local {
                database: database.clone(),
                catalog: catalog.to_string(),
                sql: sql_select(catalog, &fingerprint.fields, constraints, Some(self.max_objects))?,
            }),
        }
    }

    /// Retrieve the result of one job.
    ///
    /// `progress` receives the completion estimate after every chunk; an
    /// error from it aborts the transfer.
    pub fn fetch(
        &self,
        handle: &JobHandle,
        expected_records: Option<u64>,
        progress: &mut dyn FnMut(f64) -> Result<(), Cancelled>,
        cancel: &CancellationToken,
    ) -> Result<Table, CatalogError> {
        cancel.check()?;
        match handle {
            JobHandle::RemoteAsync {
                service, locator, ..
            } => {
                let service = self.connector.remote_async(service)?;
                match service.wait_phase(locator, self.phase_wait)? {
                    JobPhase::Pending(phase) => Err(CatalogError::Pending { phase }),
                    JobPhase::Failed(phase) => Err(CatalogError::JobFailed { phase }),
                    JobPhase::Completed => {
                        let stream = service.open_result(locator)?;
                        self.stream_table(stream, expected_records, progress, cancel)
                    }
                }
            }
            JobHandle::RemoteSync { payload } => {
                let service = self.connector.remote_sync(&payload.url)?;
                let stream = service.request(payload)?;
                self.stream_table(stream, expected_records, progress, cancel)
            }
            JobHandle::Local { database, sql, .. } => {
                let engine = self.connector.local(database)?;
                let table = engine.execute(sql)?;
                progress(RUNNING_CEILING)?;
                Ok(table)
            }
        }
    }

    /// Read a response body chunk by chunk, reporting progress, then decode.
    fn stream_table(
        &self,
        mut stream: ResultStream,
        expected_records: Option<u64>,
        progress: &mut dyn FnMut(f64) -> Result<(), Cancelled>,
        cancel: &CancellationToken,
    ) -> Result<Table, CatalogError> {
        let mut estimator = ProgressEstimator::new(expected_records);
        let mut body = Vec::new();
        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            let read = match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CatalogError::Transport(e.to_string())),
            };
            body.extend_from_slice(&chunk[..read]);
            let percent = estimator.observe(&chunk[..read]);
            cancel.check()?;
            progress(percent)?;
        }
        cancel.check()?;
        debug!("Received {} bytes", estimator.bytes_seen());
        Ok(table::decode(&body)?)
    }

    /// Release the server-side resources of a job. No-op for backends
    /// without a remote side effect.
    pub fn cancel(&self, handle: &JobHandle) -> Result<(), CatalogError> {
        match handle {
            JobHandle::RemoteAsync {
                service, locator, ..
            } => self.connector.remote_async(service)?.delete(locator),
            JobHandle::RemoteSync { .. } | JobHandle::Local { .. } => Ok(()),
        }
    }

    /// Check that a backend answers and serves every catalog.
    pub fn probe(
        &self,
        backend: &BackendId,
        catalogs: &[String],
        fields: &[String],
        conditions: &[Condition],
    ) -> ControlMessage {
        let outcome = catalogs
            .iter()
            .try_for_each(|catalog| self.probe_one(backend, catalog, fields, conditions));
        match outcome {
            Ok(()) => {
                info!("Probe of {} succeeded", backend);
                ControlMessage::success(
                    "Server checked",
                    "The server is responding and the catalog is available.",
                )
            }
            Err(CatalogError::Transport(reason)) => {
                warn!("Probe of {} failed: {}", backend, reason);
                ControlMessage::error(
                    "Server down",
                    "The server is not responding: please select a different server.",
                )
            }
            Err(err) => {
                warn!("Probe of {} failed: {}", backend, err);
                ControlMessage::error(
                    "Catalog unavailable",
                    "The catalog is not available in the selected server.",
                )
            }
        }
    }

    fn probe_one(
        &self,
        backend: &BackendId,
        catalog: &str,
        fields: &[String],
        conditions: &[Condition],
    ) -> Result<(), CatalogError> {
        let table = match backend {
            BackendId::RemoteAsync { url } => {
                let filter = condition_expression(conditions);
                let adql = adql_select(catalog, fields, Some(&filter), Some(1));
                let mut body = Vec::new();
                self.connector
                    .remote_async(url)?
                    .search(&adql, PROBE_ROWS)?
                    .read_to_end(&mut body)
                    .map_err(|e| CatalogError::Transport(e.to_string()))?;
                table::decode(&body)?
            }
            BackendId::RemoteSync { url } => {
                let payload = SyncPayload {
                    url: url.clone(),
                    source: catalog.to_string(),
                    columns: fields.to_vec(),
                    constraints: condition_map(conditions),
                    row_limit: PROBE_ROWS,
                };
                let mut body = Vec::new();
                self.connector
                    .remote_sync(url)?
                    .request(&payload)?
                    .read_to_end(&mut body)
                    .map_err(|e| CatalogError::Transport(e.to_string()))?;
                let table = table::decode(&body)?;
                if table.num_rows() == 0 {
                    return Err(TableError::Service(format!("catalog {} is empty", catalog)).into());
                }
                table
            }
            BackendId::Local { database } => {
                let filter = Constraints::Expression(condition_expression(conditions));
                let sql = sql_select(catalog, fields, &filter, Some(PROBE_ROWS))?;
                self.connector.local(database)?.execute(&sql)?
            }
        };
        debug!("Probe of {} returned {} rows", catalog, table.num_rows());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Cursor;
    use std::sync::Mutex;

    use crate::table::votable;

    struct StubTap {
        phases: Mutex<Vec<JobPhase>>,
        deleted: Mutex<Vec<String>>,
        fail_after: Option<usize>,
        submitted: Mutex<usize>,
        body: Vec<u8>,
    }

    impl AsyncJobService for StubTap {
        fn submit(&self, _query: &str, _max: u64) -> Result<SubmittedJob, CatalogError> {
            let mut submitted = self.submitted.lock().unwrap();
            if Some(*submitted) == self.fail_after {
                return Err(CatalogError::Transport("connection refused".into()));
            }
            *submitted += 1;
            Ok(SubmittedJob {
                locator: format!("job{}", submitted),
                destruction: None,
            })
        }

        fn wait_phase(&self, _locator: &str, _t: Duration) -> Result<JobPhase, CatalogError> {
            let mut phases = self.phases.lock().unwrap();
            Ok(if phases.is_empty() {
                JobPhase::Completed
            } else {
                phases.remove(0)
            })
        }

        fn open_result(&self, _locator: &str) -> Result<ResultStream, CatalogError> {
            Ok(Box::new(Cursor::new(self.body.clone())))
        }

        fn delete(&self, locator: &str) -> Result<(), CatalogError> {
            self.deleted.lock().unwrap().push(locator.to_string());
            Ok(())
        }

        fn search(&self, _query: &str, _max: u64) -> Result<ResultStream, CatalogError> {
            Err(CatalogError::Transport("unreachable".into()))
        }
    }

    struct StubConnector(Arc<StubTap>);

    impl Connector for StubConnector {
        fn remote_async(&self, _url: &str) -> Result<Arc<dyn AsyncJobService>, CatalogError> {
            Ok(self.0.clone())
        }
        fn remote_sync(&self, _url: &str) -> Result<Arc<dyn SyncQueryService>, CatalogError> {
            Err(CatalogError::Transport("no sync service".into()))
        }
        fn local(&self, _db: &str) -> Result<Arc<dyn LocalQueryEngine>, CatalogError> {
            Err(CatalogError::Local("no local engine".into()))
        }
    }

    fn client(tap: StubTap) -> (CatalogClient, Arc<StubTap>) {
        let tap = Arc::new(tap);
        let mut config = EngineConfig::with_work_dir("/tmp/unused");
        config.chunk_size = 64;
        (
            CatalogClient::new(Arc::new(StubConnector(tap.clone())), &config),
            tap,
        )
    }

    fn stub(phases: Vec<JobPhase>, fail_after: Option<usize>) -> StubTap {
        StubTap {
            phases: Mutex::new(phases),
            deleted: Mutex::new(Vec::new()),
            fail_after,
            submitted: Mutex::new(0),
            body: votable::tests::SAMPLE.as_bytes().to_vec(),
        }
    }

    fn fingerprint(catalogs: &[&str]) -> QueryFingerprint {
        QueryFingerprint::new(
            BackendId::RemoteAsync {
                url: "https://tap.example.org/tap".into(),
            },
            catalogs.iter().map(|c| c.to_string()).collect(),
            vec!["ra".into(), "dec".into()],
            Constraints::Expression("ra>10".into()),
        )
    }

    #[test]
    fn test_phase_classification() {
        assert_eq!(JobPhase::classify("COMPLETED"), JobPhase::Completed);
        assert_eq!(
            JobPhase::classify(" executing\n"),
            JobPhase::Pending("EXECUTING".into())
        );
        assert_eq!(JobPhase::classify("ABORTED"), JobPhase::Failed("ABORTED".into()));
        assert_eq!(JobPhase::classify("WEIRD"), JobPhase::Failed("WEIRD".into()));
    }

    #[test]
    fn test_submit_is_all_or_nothing() {
        let (client, tap) = client(stub(vec![], Some(1)));
        let err = client.submit(&fingerprint(&["a", "b"])).unwrap_err();
        assert!(matches!(err, CatalogError::Transport(_)));
        assert_eq!(*tap.deleted.lock().unwrap(), vec!["job1".to_string()]);
    }

    #[test]
    fn test_fetch_classifies_phases() {
        let (client, _tap) = client(stub(
            vec![JobPhase::Pending("QUEUED".into()), JobPhase::Failed("ERROR".into())],
            None,
        ));
        let handles = client.submit(&fingerprint(&["a"])).unwrap();
        let cancel = CancellationToken::new();
        let mut sink = |_p: f64| -> Result<(), Cancelled> { Ok(()) };
        let first = client.fetch(&handles[0], None, &mut sink, &cancel).unwrap_err();
        assert!(matches!(first, CatalogError::Pending { .. }));
        let second = client.fetch(&handles[0], None, &mut sink, &cancel).unwrap_err();
        assert!(matches!(second, CatalogError::JobFailed { .. }));
        let table = client.fetch(&handles[0], Some(2), &mut sink, &cancel).unwrap();
        assert_eq!(table.num_rows(), 2);
    }

    #[test]
    fn test_fetch_reports_progress_per_chunk() {
        let (client, _tap) = client(stub(vec![], None));
        let handles = client.submit(&fingerprint(&["a"])).unwrap();
        let mut reports = Vec::new();
        let mut sink = |p: f64| -> Result<(), Cancelled> {
            reports.push(p);
            Ok(())
        };
        client
            .fetch(&handles[0], Some(2), &mut sink, &CancellationToken::new())
            .unwrap();
        let chunks = votable::tests::SAMPLE.len().div_ceil(64);
        assert_eq!(reports.len(), chunks);
        assert!(reports.iter().all(|p| (0.0..100.0).contains(p)));
    }

    #[test]
    fn test_fetch_stops_when_sink_refuses() {
        let (client, _tap) = client(stub(vec![], None));
        let handles = client.submit(&fingerprint(&["a"])).unwrap();
        let mut sink = |_p: f64| -> Result<(), Cancelled> { Err(Cancelled) };
        let err = client
            .fetch(&handles[0], None, &mut sink, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, CatalogError::Cancelled));
    }

    #[test]
    fn test_sync_submission_packages_payload() {
        let (client, _tap) = client(stub(vec![], None));
        let mut map = BTreeMap::new();
        map.insert("Jmag".to_string(), "<16".to_string());
        let fp = QueryFingerprint::new(
            BackendId::RemoteSync {
                url: "https://vizier.example.org/viz-bin/votable".into(),
            },
            vec!["II/246/out".into()],
            vec!["RAJ2000".into()],
            Constraints::Columns(map.clone()),
        );
        let handles = client.submit(&fp).unwrap();
        match &handles[0] {
            JobHandle::RemoteSync { payload } => {
                assert_eq!(payload.source, "II/246/out");
                assert_eq!(payload.constraints, map);
                assert_eq!(payload.row_limit, skyflow_protocol::defaults::MAX_OBJECTS);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_probe_reports_server_down() {
        let (client, _tap) = client(stub(vec![], None));
        let msg = client.probe(
            &BackendId::RemoteAsync {
                url: "https://tap.example.org/tap".into(),
            },
            &["a".into()],
            &["ra".into()],
            &[],
        );
        assert_eq!(msg.header, "Server down");
        assert!(!msg.is_success());
    }
}
