//! Scripted backends and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use skyflow_engine::catalog::local::SqliteEngine;
use skyflow_engine::{
    AsyncJobService, CatalogError, Connector, JobPhase, LocalQueryEngine, PipelineStages,
    ResultStream, Stage, StageContext, StarCountPipeline, SubmittedJob, Supervisor,
    SyncQueryService, Table,
};
use skyflow_protocol::{
    BackendId, Constraints, CoordColumns, EngineConfig, Frame, MapGeometry, PipelineParams,
    QueryFingerprint, SyncPayload,
};

pub const TAP_URL: &str = "https://tap.example.org/tap";

/// VOTable response with one double column per name.
pub fn votable(columns: &[&str], rows: &[Vec<f64>]) -> String {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<VOTABLE version=\"1.4\">\n<RESOURCE type=\"results\">\n<INFO name=\"QUERY_STATUS\" value=\"OK\"/>\n<TABLE>\n",
    );
    for column in columns {
        out.push_str(&format!("<FIELD name=\"{}\" datatype=\"double\"/>\n", column));
    }
    out.push_str("<DATA><TABLEDATA>\n");
    for row in rows {
        out.push_str("<TR>");
        for value in row {
            out.push_str(&format!("<TD>{}</TD>", value));
        }
        out.push_str("</TR>\n");
    }
    out.push_str("</TABLEDATA></DATA>\n</TABLE>\n</RESOURCE>\n</VOTABLE>\n");
    out
}

/// Control field: a 2x2 degree box around (10, 0).
pub fn reference_rows() -> Vec<Vec<f64>> {
    vec![
        vec![9.0, -1.0],
        vec![11.0, -1.0],
        vec![9.0, 1.0],
        vec![11.0, 1.0],
        vec![10.0, 0.0],
    ]
}

pub fn science_rows() -> Vec<Vec<f64>> {
    vec![vec![10.0, 0.0], vec![10.2, 0.1], vec![9.5, -0.5]]
}

fn catalog_of(query: &str) -> Option<String> {
    let rest = &query[query.find("FROM ")? + 5..];
    rest.split_whitespace().next().map(str::to_string)
}

/// TAP service driven by a phase script.
///
/// `wait_phase` pops the next scripted phase and answers `Completed` once
/// the script is exhausted.
#[derive(Default)]
pub struct ScriptedTap {
    phases: Mutex<VecDeque<JobPhase>>,
    bodies: Mutex<HashMap<String, String>>,
    jobs: Mutex<HashMap<String, String>>,
    deleted: Mutex<Vec<String>>,
    broken: AtomicBool,
    submits: AtomicUsize,
    waits: AtomicUsize,
    opens: AtomicUsize,
}

impl ScriptedTap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_catalog(&self, catalog: &str, body: String) -> &Self {
        self.bodies.lock().unwrap().insert(catalog.to_string(), body);
        self
    }

    pub fn script(&self, phases: impl IntoIterator<Item = JobPhase>) {
        self.phases.lock().unwrap().extend(phases);
    }

    /// Make every result download fail at the transport level.
    pub fn break_transfers(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn body(&self, catalog: &str) -> Result<String, CatalogError> {
        self.bodies
            .lock()
            .unwrap()
            .get(catalog)
            .cloned()
            .ok_or_else(|| CatalogError::Rejected(format!("no table {}", catalog)))
    }
}

impl AsyncJobService for ScriptedTap {
    fn submit(&self, query: &str, _max_records: u64) -> Result<SubmittedJob, CatalogError> {
        let catalog =
            catalog_of(query).ok_or_else(|| CatalogError::Rejected("no FROM clause".into()))?;
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        let locator = format!("{}/async/job{}", TAP_URL, n);
        self.jobs.lock().unwrap().insert(locator.clone(), catalog);
        Ok(SubmittedJob {
            locator,
            destruction: Some(Utc::now() + chrono::Duration::hours(1)),
        })
    }

    fn wait_phase(&self, _locator: &str, _timeout: Duration) -> Result<JobPhase, CatalogError> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .phases
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(JobPhase::Completed))
    }

    fn open_result(&self, locator: &str) -> Result<ResultStream, CatalogError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            return Err(CatalogError::Transport("connection reset by peer".into()));
        }
        let catalog = self
            .jobs
            .lock()
            .unwrap()
            .get(locator)
            .cloned()
            .ok_or_else(|| CatalogError::Rejected(format!("unknown job {}", locator)))?;
        Ok(Box::new(Cursor::new(self.body(&catalog)?.into_bytes())))
    }

    fn delete(&self, locator: &str) -> Result<(), CatalogError> {
        self.deleted.lock().unwrap().push(locator.to_string());
        Ok(())
    }

    fn search(&self, query: &str, _max_records: u64) -> Result<ResultStream, CatalogError> {
        let catalog =
            catalog_of(query).ok_or_else(|| CatalogError::Rejected("no FROM clause".into()))?;
        Ok(Box::new(Cursor::new(self.body(&catalog)?.into_bytes())))
    }
}

/// SQLite engine that counts the statements it runs.
pub struct CountingEngine {
    inner: SqliteEngine,
    executes: AtomicUsize,
}

impl CountingEngine {
    pub fn open(path: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteEngine::open(path).unwrap(),
            executes: AtomicUsize::new(0),
        })
    }

    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }
}

impl LocalQueryEngine for CountingEngine {
    fn execute(&self, sql: &str) -> Result<Table, CatalogError> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(sql)
    }
}

/// Catalog form service answering every request with one body.
pub struct FixedSyncService(pub String);

impl SyncQueryService for FixedSyncService {
    fn request(&self, _payload: &SyncPayload) -> Result<ResultStream, CatalogError> {
        Ok(Box::new(Cursor::new(self.0.clone().into_bytes())))
    }
}

/// Catalog form service whose response stalls at its end until the gate
/// opens, leaving a run parked in the middle of a download.
pub struct HeldSyncService {
    body: String,
    gate: Arc<Gate>,
}

impl HeldSyncService {
    pub fn new(body: String, gate: Arc<Gate>) -> Self {
        Self { body, gate }
    }
}

struct HeldReader {
    inner: Cursor<Vec<u8>>,
    gate: Arc<Gate>,
}

impl Read for HeldReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            self.gate.hold();
        }
        Ok(n)
    }
}

impl SyncQueryService for HeldSyncService {
    fn request(&self, _payload: &SyncPayload) -> Result<ResultStream, CatalogError> {
        Ok(Box::new(HeldReader {
            inner: Cursor::new(self.body.clone().into_bytes()),
            gate: Arc::clone(&self.gate),
        }))
    }
}

#[derive(Default)]
pub struct ScriptedConnector {
    pub tap: Option<Arc<ScriptedTap>>,
    pub sync: Option<Arc<dyn SyncQueryService>>,
    pub local: Option<Arc<CountingEngine>>,
}

impl Connector for ScriptedConnector {
    fn remote_async(&self, _url: &str) -> Result<Arc<dyn AsyncJobService>, CatalogError> {
        match &self.tap {
            Some(tap) => Ok(tap.clone()),
            None => Err(CatalogError::Transport("connection refused".into())),
        }
    }

    fn remote_sync(&self, _url: &str) -> Result<Arc<dyn SyncQueryService>, CatalogError> {
        match &self.sync {
            Some(sync) => Ok(sync.clone()),
            None => Err(CatalogError::Transport("connection refused".into())),
        }
    }

    fn local(&self, _database: &str) -> Result<Arc<dyn LocalQueryEngine>, CatalogError> {
        match &self.local {
            Some(engine) => Ok(engine.clone()),
            None => Err(CatalogError::Local("no database".into())),
        }
    }
}

/// Create a SQLite catalog `stars` with galactic coordinates.
pub fn star_database(path: &Path, rows: &[Vec<f64>]) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute("CREATE TABLE stars (glon REAL, glat REAL)", [])
        .unwrap();
    for row in rows {
        conn.execute(
            "INSERT INTO stars (glon, glat) VALUES (?1, ?2)",
            rusqlite::params![row[0], row[1]],
        )
        .unwrap();
    }
}

pub fn config(work_dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::with_work_dir(work_dir);
    config.retry_backoff = Duration::ZERO;
    config.phase_wait = Duration::from_millis(10);
    config.chunk_size = 128;
    config
}

pub fn params() -> PipelineParams {
    let mut coords = BTreeMap::new();
    coords.insert(
        Frame::Galactic,
        CoordColumns {
            lon: "glon".into(),
            lat: "glat".into(),
        },
    );
    PipelineParams {
        expected_primary: Some(3),
        expected_reference: Some(5),
        coords,
        map: MapGeometry {
            frame: Frame::Galactic,
            naxis1: 4,
            naxis2: 4,
            crpix1: 2.5,
            crpix2: 2.5,
            crval1: 10.0,
            crval2: 0.0,
            scale: 3600.0,
            projection: "TAN".into(),
        },
        products: Vec::new(),
        options: serde_json::Value::Null,
    }
}

pub fn tap_query(catalog: &str, filter: &str) -> QueryFingerprint {
    QueryFingerprint::new(
        BackendId::RemoteAsync {
            url: TAP_URL.into(),
        },
        vec![catalog.to_string()],
        vec!["glon".into(), "glat".into()],
        Constraints::Expression(filter.to_string()),
    )
}

/// Catalog form query on `catalog` with one column constraint.
pub fn sync_query(catalog: &str, column: &str, constraint: &str) -> QueryFingerprint {
    let mut columns = BTreeMap::new();
    columns.insert(column.to_string(), constraint.to_string());
    QueryFingerprint::new(
        BackendId::RemoteSync {
            url: "https://vizier.example.org/viz-bin/votable".into(),
        },
        vec![catalog.to_string()],
        vec!["glon".into(), "glat".into()],
        Constraints::Columns(columns),
    )
}

/// Opened by the test to let a held run continue.
#[derive(Default)]
pub struct Gate {
    reached: AtomicBool,
    open: AtomicBool,
}

impl Gate {
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn wait_reached(&self, timeout: Duration) -> bool {
        wait_until(timeout, || self.reached.load(Ordering::SeqCst))
    }

    /// Mark the gate reached and block until it opens.
    fn hold(&self) {
        self.reached.store(true, Ordering::SeqCst);
        while !self.open.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
    }
}

struct Hold(Arc<Gate>);

impl Stage for Hold {
    fn name(&self) -> &str {
        "hold"
    }

    fn progress(&self) -> u8 {
        50
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<()> {
        ctx.report("Waiting at the gate")?;
        self.0.reached.store(true, Ordering::SeqCst);
        while !self.0.open.load(Ordering::SeqCst) {
            ctx.check()?;
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

/// The star-count pipeline with a gate at 50% between retrieval and map
/// making.
pub struct GatedPipeline(pub Arc<Gate>);

impl PipelineStages for GatedPipeline {
    fn stages(&self, params: &PipelineParams) -> Vec<Box<dyn Stage>> {
        let mut stages = StarCountPipeline.stages(params);
        stages.insert(2, Box::new(Hold(Arc::clone(&self.0))));
        stages
    }
}

pub fn supervisor(
    work_dir: &Path,
    connector: ScriptedConnector,
    stages: Arc<dyn PipelineStages>,
) -> Supervisor {
    Supervisor::new(config(work_dir), Arc::new(connector), stages).unwrap()
}

/// Tap serving a science catalog `sci` and a control catalog `ctl`.
pub fn star_tap() -> Arc<ScriptedTap> {
    let tap = ScriptedTap::new();
    tap.with_catalog("sci", votable(&["glon", "glat"], &science_rows()))
        .with_catalog("ctl", votable(&["glon", "glat"], &reference_rows()));
    tap
}

pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}
