//! Process supervisor: one pipeline run per session on a shared worker pool.
//!
//! A session's run goes `idle -> run -> {end | error | abort}`. The run's
//! progress is kept by the log core; control calls read and close it there,
//! the worker appends to it and unwinds as soon as an append is refused or
//! its cancellation token trips. Control calls for one session serialize on
//! that session's slot mutex.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use skyflow_protocol::defaults::{MAX_AREA_OBJECTS, STOPPED_MESSAGE_PREFIX};
use skyflow_protocol::paths::session_from_file_name;
use skyflow_protocol::{
    AreaReply, BackendId, Checkpoint, ControlMessage, ControlReply, EngineConfig, JobHandle, MonitorReply,
    PipelineParams, ProcessLogEntry, ProcessState, QueryFingerprint, SessionFiles, SessionId, Step,
};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStats, ResultCache};
use crate::cancel::{CancellationToken, Cancelled};
use crate::catalog::query::Condition;
use crate::catalog::{CatalogClient, Connector, DefaultConnector};
use crate::core::{apply_append, spawn_log_core, LogError, LogHandle, RunId};
use crate::density::{area_verdict, format_count, Area, DensityMap};
use crate::error::{ControlError, PipelineError, RetrieveError};
use crate::pool::{panic_message, WorkerPool};
use crate::raster::{self, RasterError};
use crate::registry::{JobRegistry, SessionJobs};
use crate::retriever::{ProgressSink, Retriever};
use crate::stages::{PipelineStages, StageContext, StarCountPipeline};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Signalled once a run's worker is done, whatever the outcome.
#[derive(Debug, Clone, Default)]
struct Completion(Arc<(Mutex<bool>, Condvar)>);

impl Completion {
    fn finish(&self) {
        let (done, cvar) = &*self.0;
        *lock(done) = true;
        cvar.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let (done, cvar) = &*self.0;
        let guard = lock(done);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Finishes the completion even when the run panics.
struct FinishOnDrop(Completion);

impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.finish();
    }
}

#[derive(Debug)]
struct ProcessRecord {
    run: RunId,
    cancel: CancellationToken,
    completion: Completion,
    params: PipelineParams,
}

#[derive(Debug, Default)]
struct SessionSlot {
    jobs: SessionJobs,
    process: Option<ProcessRecord>,
}

/// Everything a run needs, shared with the pool threads.
struct RunEnv {
    config: EngineConfig,
    retriever: Retriever,
    stages: Arc<dyn PipelineStages>,
    log: LogHandle,
}

pub struct Supervisor {
    env: Arc<RunEnv>,
    catalog: Arc<CatalogClient>,
    registry: JobRegistry,
    pool: WorkerPool,
    sessions: Mutex<HashMap<SessionId, Arc<Mutex<SessionSlot>>>>,
    next_run: AtomicU64,
    log_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        stages: Arc<dyn PipelineStages>,
    ) -> Result<Self, ControlError> {
        fs::create_dir_all(&config.work_dir)?;
        let catalog = Arc::new(CatalogClient::new(connector, &config));
        let cache = Arc::new(ResultCache::new(&config.work_dir, config.use_cache));
        let retriever = Retriever::new(
            Arc::clone(&catalog),
            Arc::clone(&cache),
            config.max_failures,
            config.retry_backoff,
        );
        let registry = JobRegistry::new(Arc::clone(&catalog), cache, config.expiry_margin);
        let (log, log_thread) = spawn_log_core()?;
        let pool = WorkerPool::new(config.pool_size, "skyflow-run")?;
        info!(
            "Supervisor ready: {} workers, work dir {}",
            config.pool_size,
            config.work_dir.display()
        );
        Ok(Self {
            env: Arc::new(RunEnv {
                config,
                retriever,
                stages,
                log,
            }),
            catalog,
            registry,
            pool,
            sessions: Mutex::new(HashMap::new()),
            next_run: AtomicU64::new(1),
            log_thread: Mutex::new(Some(log_thread)),
        })
    }

    /// Supervisor over the bundled HTTP/SQLite backends and the star-count
    /// pipeline.
    pub fn with_defaults(config: EngineConfig) -> Result<Self, ControlError> {
        let connector = Arc::new(DefaultConnector::new(&config)?);
        Self::new(config, connector, Arc::new(StarCountPipeline))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.env.config
    }

    pub fn files(&self, session: &SessionId) -> SessionFiles {
        SessionFiles::new(&self.env.config.work_dir, session)
    }

    /// Number of sessions the supervisor holds state for.
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.env.retriever.cache().stats()
    }

    fn existing_slot(&self, session: &SessionId) -> Option<Arc<Mutex<SessionSlot>>> {
        lock(&self.sessions).get(session).cloned()
    }

    /// Run `f` under the session's slot lock, creating the slot on first
    /// use. Retries when the slot was dropped from the map while waiting
    /// for its lock.
    fn locked_slot<R>(&self, session: &SessionId, f: impl FnOnce(&mut SessionSlot) -> R) -> R {
        loop {
            let slot = Arc::clone(lock(&self.sessions).entry(session.clone()).or_default());
            let mut guard = lock(&slot);
            let current = self
                .existing_slot(session)
                .is_some_and(|s| Arc::ptr_eq(&s, &slot));
            if current {
                return f(&mut guard);
            }
        }
    }

    /// Drop the session's slot; the caller holds its lock.
    fn forget_slot(&self, session: &SessionId) {
        lock(&self.sessions).remove(session);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Register the query of one step. Returns its job handles, empty when
    /// the jobs could not be submitted.
    pub fn submit_query(
        &self,
        session: &SessionId,
        step: Step,
        fingerprint: &QueryFingerprint,
    ) -> Vec<JobHandle> {
        self.locked_slot(session, |slot| {
            let SessionSlot { jobs, process } = slot;
            self.registry
                .execute(jobs, session, step, fingerprint, || {
                    self.discard_process(session, process)
                })
        })
    }

    /// Estimate the objects inside `area`. When `query` is given and the
    /// area is not too crowded, the query is registered as well.
    pub fn check_area(
        &self,
        density: &dyn DensityMap,
        area: &Area,
        query: Option<(&SessionId, Step, &QueryFingerprint)>,
    ) -> AreaReply {
        let estimate = match density.estimate(area) {
            Ok(estimate) => estimate,
            Err(e) => {
                warn!("Cannot check area: {}", e);
                return AreaReply {
                    message: ControlMessage::error("Area check failed", e.to_string()),
                    estimate: 0.0,
                    handles: Vec::new(),
                };
            }
        };
        let message = area_verdict(estimate);
        debug!("Area estimate {}: {}", format_count(estimate), message.content);
        let handles = match query {
            Some((session, step, fingerprint)) if estimate < MAX_AREA_OBJECTS => {
                self.submit_query(session, step, fingerprint)
            }
            _ => Vec::new(),
        };
        AreaReply {
            message,
            estimate,
            handles,
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
        self.catalog.probe(backend, catalogs, fields, conditions)
    }

    // ========================================================================
    // Process control
    // ========================================================================

    /// Start a run, or restart it with the saved parameters when `params`
    /// is `None`. A running run is stopped first.
    pub fn start_process(&self, session: &SessionId, params: Option<PipelineParams>) -> ControlReply {
        let (restart, started) = self.locked_slot(session, |slot| {
            (slot.process.is_some(), self.start_locked(session, slot, params))
        });
        let message = match started {
            Ok(run) => {
                info!("Started {} for session {}", run, session);
                ControlMessage::success(
                    "Connection established",
                    "The server has accepted the connection and has started the pipeline.",
                )
            }
            Err(e) => {
                error!(
                    "Fatal error during process {}: {}",
                    if restart { "restart" } else { "creation" },
                    e
                );
                ControlMessage::error(
                    "Pipeline error",
                    format!(
                        "Error {}starting the pipeline for session ID {}:\n{}",
                        if restart { "re" } else { "" },
                        session,
                        e
                    ),
                )
            }
        };
        ControlReply {
            message,
            logs: self.env.log.snapshot(session).unwrap_or_default(),
        }
    }

    fn start_locked(
        &self,
        session: &SessionId,
        slot: &mut SessionSlot,
        params: Option<PipelineParams>,
    ) -> Result<RunId, ControlError> {
        let files = self.files(session);
        let params = match params {
            Some(params) => params,
            None => match &slot.process {
                Some(record) => record.params.clone(),
                None => load_checkpoint(&files.checkpoint)
                    .map(|c| c.params)
                    .map_err(|_| ControlError::NoParameters {
                        session: session.clone(),
                    })?,
            },
        };

        if let Some(record) = slot.process.take() {
            let stopped = self.stop_record(session, &record);
            record.cancel.cancel();
            match stopped {
                Ok(_) => info!("Stopped {} of session {} for a restart", record.run, session),
                Err(ControlError::NotRunning { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let checkpoint = Checkpoint {
            session: session.clone(),
            params: params.clone(),
            primary_jobs: slot.jobs.handles(Step::Primary),
            reference_jobs: slot.jobs.handles(Step::Reference),
            created_at: Utc::now(),
        };
        save_checkpoint(&files.checkpoint, &checkpoint)?;

        let run = RunId(self.next_run.fetch_add(1, Ordering::SeqCst));
        self.env
            .log
            .reset(session, run)
            .map_err(|_| ControlError::LogUnavailable)?;
        let cancel = CancellationToken::new();
        let completion = Completion::default();

        let env = Arc::clone(&self.env);
        let task_session = session.clone();
        let task_cancel = cancel.clone();
        let task_completion = completion.clone();
        self.pool.submit(move || {
            let _finish = FinishOnDrop(task_completion);
            execute_run(&env, &task_session, run, &checkpoint, &task_cancel);
        })?;

        slot.process = Some(ProcessRecord {
            run,
            cancel,
            completion,
            params,
        });
        Ok(run)
    }

    /// Close the running run with an `abort` entry and trip its token.
    fn stop_record(
        &self,
        session: &SessionId,
        record: &ProcessRecord,
    ) -> Result<ProcessLogEntry, ControlError> {
        let running = matches!(
            self.env.log.current(session),
            Ok(Some((run, _))) if run == record.run
        );
        if !running {
            return Err(ControlError::NotRunning {
                session: session.clone(),
            });
        }
        let message = format!("{} {}", STOPPED_MESSAGE_PREFIX, session);
        let entry = self.env.log.stop(session, &message).map_err(|e| match e {
            LogError::Unavailable => ControlError::LogUnavailable,
            _ => ControlError::NotRunning {
                session: session.clone(),
            },
        })?;
        record.cancel.cancel();
        info!("{}", message);
        Ok(entry)
    }

    pub fn stop_process(&self, session: &SessionId) -> ControlReply {
        let result = self.locked_slot(session, |slot| match &slot.process {
            Some(record) => self.stop_record(session, record),
            None => Err(ControlError::NotRunning {
                session: session.clone(),
            }),
        });
        let message = match result {
            Ok(entry) => ControlMessage::success("Aborting", entry.message),
            Err(e) => {
                warn!("Cannot stop process: {}", e);
                ControlMessage::error("Error", e.to_string())
            }
        };
        ControlReply {
            message,
            logs: self.env.log.snapshot(session).unwrap_or_default(),
        }
    }

    /// Stop the run if needed, release both steps' jobs, delete the
    /// session's process files and forget its log.
    pub fn abort_process(&self, session: &SessionId, silent: bool) -> ControlReply {
        self.locked_slot(session, |slot| {
            if let Some(record) = &slot.process {
                // Not running is fine here: the run may already have ended
                let _ = self.stop_record(session, record);
            }

            let has_log = matches!(self.env.log.current(session), Ok(Some(_)));
            if slot.process.is_none() && !has_log {
                if slot.jobs.is_empty() {
                    self.forget_slot(session);
                }
                let err = ControlError::NoProcess {
                    session: session.clone(),
                };
                if !silent {
                    warn!("Fatal error during process full abort: {}", err);
                }
                return ControlReply {
                    message: ControlMessage::error("Error", err.to_string()),
                    logs: Vec::new(),
                };
            }

            let message = format!("Aborting process for session ID {}", session);
            info!("{}", message);
            if let Some(record) = slot.process.take() {
                record.cancel.cancel();
            }
            self.registry.abort_all(&mut slot.jobs, session);
            self.remove_process_files(session);
            let logs = self.env.log.clear(session).unwrap_or_default();
            self.forget_slot(session);
            ControlReply {
                message: ControlMessage::success("Aborting", message),
                logs,
            }
        })
    }

    /// Stop and forget the process of a session whose query changed.
    fn discard_process(&self, session: &SessionId, process: &mut Option<ProcessRecord>) {
        let Some(record) = process.take() else {
            return;
        };
        if self.stop_record(session, &record).is_ok() {
            debug!("Stopped {} of session {}", record.run, session);
        }
        record.cancel.cancel();
        self.remove_process_files(session);
        let _ = self.env.log.clear(session);
        info!(
            "Discarded the process of session {} after a query change",
            session
        );
    }

    fn remove_process_files(&self, session: &SessionId) {
        let files = self.files(session);
        for path in files.process_files() {
            remove_file(path);
        }
    }

    pub fn monitor(&self, session: &SessionId) -> MonitorReply {
        let log = self.env.log.snapshot(session).unwrap_or_default();
        MonitorReply {
            success: !log.is_empty(),
            log,
        }
    }

    /// Standalone image of one plane of the session's artifact.
    pub fn download(&self, artifact: &str, session: &SessionId) -> Result<Vec<u8>, ControlError> {
        let index = raster::plane_index(artifact)
            .ok_or_else(|| ControlError::UnknownArtifact(artifact.to_string()))?;
        let files = self.files(session);
        match raster::extract_plane_from_file(&files.artifact, index) {
            Ok(bytes) => Ok(bytes),
            Err(RasterError::MissingPlane(plane)) => Err(ControlError::MissingPlane(plane)),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until the session's current run has finished. Returns `false`
    /// on timeout or when there is no run.
    pub fn wait_for_run(&self, session: &SessionId, timeout: Duration) -> bool {
        let Some(slot) = self.existing_slot(session) else {
            return false;
        };
        let completion = match &lock(&slot).process {
            Some(record) => record.completion.clone(),
            None => return false,
        };
        completion.wait(timeout)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    fn is_active(&self, session: &SessionId) -> bool {
        let Some(slot) = self.existing_slot(session) else {
            return false;
        };
        let slot = lock(&slot);
        slot_is_running(&slot)
    }

    /// Release the jobs and log of a session whose files were swept, unless
    /// a run started meanwhile.
    fn forget_idle(&self, session: &SessionId) {
        if self.existing_slot(session).is_none() {
            return;
        }
        let forgotten = self.locked_slot(session, |slot| {
            if slot_is_running(slot) {
                return false;
            }
            slot.process = None;
            self.registry.abort_all(&mut slot.jobs, session);
            let _ = self.env.log.clear(session);
            self.forget_slot(session);
            true
        });
        if forgotten {
            debug!("Forgot idle session {}", session);
        }
    }

    /// Remove session files untouched for the stale grace period, except
    /// those of sessions with a run in progress. Returns the number removed.
    pub fn sweep_stale(&self) -> Result<usize, ControlError> {
        let grace = self.env.config.stale_grace;
        let now = SystemTime::now();
        let mut removed = 0;
        let mut swept = HashSet::new();
        for entry in fs::read_dir(&self.env.config.work_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(session) = name.to_str().and_then(session_from_file_name) else {
                continue;
            };
            let modified = entry.metadata()?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age < grace || self.is_active(&session) {
                continue;
            }
            if remove_file(&entry.path()) {
                removed += 1;
            }
            swept.insert(session);
        }
        for session in &swept {
            self.forget_idle(session);
        }
        if removed > 0 {
            info!("Swept {} stale session files", removed);
        }
        Ok(removed)
    }

    /// Run a pipeline synchronously from a checkpoint file, without a live
    /// log. Failures are returned to the caller.
    pub fn resume(&self, checkpoint_path: &Path) -> Result<Vec<ProcessLogEntry>, PipelineError> {
        let checkpoint = load_checkpoint(checkpoint_path)?;
        let cancel = CancellationToken::new();
        let reporter = RunReporter::headless(&checkpoint.session, &cancel);
        info!("Resuming session {} from {}", checkpoint.session, checkpoint_path.display());
        match run_guarded(&self.env, &checkpoint, &cancel, &reporter) {
            Ok(()) => Ok(reporter.into_entries()),
            Err(e) => {
                error!("Fatal error during process execution: {:?}", e);
                reporter.fail(&e);
                Err(e)
            }
        }
    }

    /// Cancel every run, drain the pool and stop the log core.
    pub fn shutdown(&self) {
        let slots: Vec<_> = lock(&self.sessions).values().cloned().collect();
        for slot in slots {
            if let Some(record) = &lock(&slot).process {
                record.cancel.cancel();
            }
        }
        self.pool.shutdown();
        let stats = self.cache_stats();
        debug!("Result cache: {} hits, {} writes", stats.hits, stats.writes);
        let _ = self.env.log.shutdown();
        if let Some(thread) = lock(&self.log_thread).take() {
            if thread.join().is_err() {
                error!("Progress log thread panicked");
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn slot_is_running(slot: &SessionSlot) -> bool {
    slot.process
        .as_ref()
        .is_some_and(|record| !record.completion.wait(Duration::ZERO))
}

fn remove_file(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {}", path.display());
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Cannot remove {}: {}", path.display(), e);
            false
        }
    }
}

fn load_checkpoint(path: &Path) -> Result<Checkpoint, PipelineError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn save_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<(), ControlError> {
    let bytes = serde_json::to_vec_pretty(checkpoint)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

// ============================================================================
// Run execution
// ============================================================================

enum LogTarget<'a> {
    Shared { log: &'a LogHandle, run: RunId },
    Local(RefCell<Vec<ProcessLogEntry>>),
}

/// Writes a run's progress: log entries, the execution log file and
/// tracing events.
struct RunReporter<'a> {
    session: &'a SessionId,
    target: LogTarget<'a>,
    cancel: &'a CancellationToken,
    started: Instant,
    percent: Cell<u8>,
    file: RefCell<Option<File>>,
}

impl<'a> RunReporter<'a> {
    fn shared(
        session: &'a SessionId,
        log: &'a LogHandle,
        run: RunId,
        cancel: &'a CancellationToken,
        execution_log: &Path,
    ) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(execution_log)
            .map_err(|e| warn!("Cannot open {}: {}", execution_log.display(), e))
            .ok();
        Self {
            session,
            target: LogTarget::Shared { log, run },
            cancel,
            started: Instant::now(),
            percent: Cell::new(0),
            file: RefCell::new(file),
        }
    }

    fn headless(session: &'a SessionId, cancel: &'a CancellationToken) -> Self {
        Self {
            session,
            target: LogTarget::Local(RefCell::new(Vec::new())),
            cancel,
            started: Instant::now(),
            percent: Cell::new(0),
            file: RefCell::new(None),
        }
    }

    fn append(&self, state: ProcessState, message: &str) -> Result<(), Cancelled> {
        let entry = ProcessLogEntry::new(
            self.started.elapsed().as_secs_f64(),
            state,
            self.percent.get(),
            message,
        );
        if entry.is_progress() {
            debug!("[{}] {}", self.session, message);
        } else {
            info!("[{}] {}", self.session, message);
            if let Some(file) = self.file.borrow_mut().as_mut() {
                let _ = writeln!(
                    file,
                    "{:9.2} {:5} {:3}% {}",
                    entry.time,
                    entry.state.as_str(),
                    entry.percent,
                    entry.message
                );
            }
        }
        match &self.target {
            LogTarget::Shared { log, run } => log
                .append(self.session, *run, entry)
                .map(|_| ())
                .map_err(|e| {
                    debug!("Progress log refused an entry of {}: {}", run, e);
                    Cancelled
                }),
            LogTarget::Local(entries) => apply_append(&mut entries.borrow_mut(), entry)
                .map(|_| ())
                .map_err(|_| Cancelled),
        }
    }

    fn finish(&self, message: &str) -> Result<(), Cancelled> {
        self.cancel.check()?;
        self.percent.set(100);
        self.append(ProcessState::End, message)
    }

    /// Record the terminal `error` entry; a closed log keeps its entry.
    fn fail(&self, err: &PipelineError) {
        let _ = self.append(
            ProcessState::Error,
            &format!("Error: {}\n{}", err.kind(), err),
        );
    }

    fn into_entries(self) -> Vec<ProcessLogEntry> {
        match self.target {
            LogTarget::Local(entries) => entries.into_inner(),
            LogTarget::Shared { .. } => Vec::new(),
        }
    }
}

impl ProgressSink for RunReporter<'_> {
    fn report(&self, message: &str) -> Result<(), Cancelled> {
        self.cancel.check()?;
        self.append(ProcessState::Run, message)
    }

    fn set_percent(&self, percent: u8) {
        self.percent.set(percent.min(100));
    }
}

/// Map a stage failure onto the pipeline error taxonomy.
fn stage_error(stage: &str, err: anyhow::Error) -> PipelineError {
    if err.is::<Cancelled>() {
        return PipelineError::Cancelled;
    }
    match err.downcast::<RetrieveError>() {
        Ok(retrieve) => PipelineError::Retrieve(retrieve),
        Err(source) => PipelineError::Stage {
            stage: stage.to_string(),
            source,
        },
    }
}

fn run_pipeline(
    env: &RunEnv,
    checkpoint: &Checkpoint,
    cancel: &CancellationToken,
    reporter: &RunReporter<'_>,
) -> Result<(), PipelineError> {
    let session = &checkpoint.session;
    reporter.set_percent(1);
    reporter.report(&format!("Starting (session id: {})", session))?;

    let stages = env.stages.stages(&checkpoint.params);
    let mut ctx = StageContext::new(session, checkpoint, &env.retriever, reporter, cancel);
    for stage in &stages {
        cancel.check()?;
        reporter.set_percent(stage.progress());
        debug!("Session {} entering stage {}", session, stage.name());
        stage
            .run(&mut ctx)
            .map_err(|e| stage_error(stage.name(), e))?;
    }

    cancel.check()?;
    reporter.set_percent(95);
    reporter.report("Saving results")?;
    let cube = ctx
        .take_artifact()
        .ok_or_else(|| PipelineError::MissingInput("no stage produced a map".to_string()))?;
    let files = SessionFiles::new(&env.config.work_dir, session);
    cancel.check()?;
    cube.write_to(&files.artifact)?;
    // A query change may have removed the session files meanwhile
    if cancel.is_cancelled() {
        remove_file(&files.artifact);
        return Err(PipelineError::Cancelled);
    }
    reporter.finish("Process completed")?;
    Ok(())
}

/// `run_pipeline` with a panicking stage turned into a pipeline error.
fn run_guarded(
    env: &RunEnv,
    checkpoint: &Checkpoint,
    cancel: &CancellationToken,
    reporter: &RunReporter<'_>,
) -> Result<(), PipelineError> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        run_pipeline(env, checkpoint, cancel, reporter)
    }))
    .unwrap_or_else(|payload| Err(PipelineError::Panic(panic_message(payload.as_ref()))))
}

/// Background run: failures end up in the log only.
fn execute_run(
    env: &RunEnv,
    session: &SessionId,
    run: RunId,
    checkpoint: &Checkpoint,
    cancel: &CancellationToken,
) {
    let files = SessionFiles::new(&env.config.work_dir, session);
    let reporter = RunReporter::shared(session, &env.log, run, cancel, &files.execution_log);
    match run_guarded(env, checkpoint, cancel, &reporter) {
        Ok(()) => info!("{} of session {} completed", run, session),
        Err(e) if e.is_cancellation() || cancel.is_cancelled() => {
            info!("{} of session {} stopped", run, session)
        }
        Err(e) => {
            error!("Fatal error during {} of session {}: {:?}", run, session, e);
            reporter.fail(&e);
        }
    }
}
