//! Shared data model: sessions, steps, fingerprints, job handles, progress log.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::defaults::PROGRESS_PREFIX;

// ============================================================================
// Sessions and steps
// ============================================================================

/// Identifier of one client session.
///
/// Session ids end up in file names, so only ASCII alphanumerics, `-` and `_`
/// are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Create a new random session id
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn parse(value: impl Into<String>) -> Result<Self, SessionIdError> {
        let value = value.into();
        if value.is_empty() {
            return Err(SessionIdError::Empty);
        }
        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(SessionIdError::InvalidChar { value, bad });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

impl FromStr for SessionId {
    type Err = SessionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionIdError {
    #[error("session id cannot be empty")]
    Empty,
    #[error("invalid character {bad:?} in session id {value:?}")]
    InvalidChar { value: String, bad: char },
}

/// Query stage of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Step {
    /// Science field (step 1)
    Primary,
    /// Control field (step 2)
    Reference,
}

impl Step {
    pub const ALL: [Step; 2] = [Step::Primary, Step::Reference];

    pub fn number(self) -> u8 {
        match self {
            Step::Primary => 1,
            Step::Reference => 2,
        }
    }

    /// The complementary step
    pub fn other(self) -> Step {
        match self {
            Step::Primary => Step::Reference,
            Step::Reference => Step::Primary,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Step::Primary => "science field",
            Step::Reference => "control field",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

impl TryFrom<u8> for Step {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Step::Primary),
            2 => Ok(Step::Reference),
            other => Err(format!("Invalid step: {}. Expected 1 or 2", other)),
        }
    }
}

impl From<Step> for u8 {
    fn from(value: Step) -> Self {
        value.number()
    }
}

/// Celestial reference frame of a coordinate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frame {
    #[serde(alias = "E")]
    Icrs,
    #[serde(alias = "G")]
    Galactic,
}

impl Frame {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frame::Icrs => "icrs",
            Frame::Galactic => "galactic",
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Query identity
// ============================================================================

/// Kind of query execution mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    RemoteAsync,
    RemoteSync,
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::RemoteAsync => "remote_async",
            BackendKind::RemoteSync => "remote_sync",
            BackendKind::Local => "local",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which service a query goes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendId {
    /// TAP-like service with a server-side job lifecycle
    RemoteAsync { url: String },
    /// Catalog service answering each request directly
    RemoteSync { url: String },
    /// Embedded engine over a local, pre-indexed database file
    Local { database: String },
}

impl BackendId {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendId::RemoteAsync { .. } => BackendKind::RemoteAsync,
            BackendId::RemoteSync { .. } => BackendKind::RemoteSync,
            BackendId::Local { .. } => BackendKind::Local,
        }
    }

    /// Service URL or database path
    pub fn address(&self) -> &str {
        match self {
            BackendId::RemoteAsync { url } | BackendId::RemoteSync { url } => url,
            BackendId::Local { database } => database,
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.address())
    }
}

/// Row selection of a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Constraints {
    /// ADQL/SQL boolean expression
    Expression(String),
    /// Column name -> condition, in the `>=a & <=b` style of catalog form services
    Columns(BTreeMap<String, String>),
}

impl Constraints {
    pub fn is_empty(&self) -> bool {
        match self {
            Constraints::Expression(expr) => expr.trim().is_empty(),
            Constraints::Columns(map) => map.is_empty(),
        }
    }

    /// Canonical text form, used for hashing
    pub fn canonical(&self) -> String {
        match self {
            Constraints::Expression(expr) => format!("expr:{}", expr.trim()),
            Constraints::Columns(map) => {
                let parts: Vec<String> = map.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                format!("cols:{}", parts.join(";"))
            }
        }
    }
}

/// Canonical identity of a query.
///
/// Equality is plain structural equality over owned strings, so two
/// fingerprints compare the same way everywhere (job reuse, cache validity,
/// cross-step reuse).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryFingerprint {
    pub backend: BackendId,
    pub catalogs: Vec<String>,
    pub fields: Vec<String>,
    pub constraints: Constraints,
}

impl QueryFingerprint {
    pub fn new(
        backend: BackendId,
        catalogs: Vec<String>,
        fields: Vec<String>,
        constraints: Constraints,
    ) -> Self {
        Self {
            backend,
            catalogs,
            fields,
            constraints,
        }
    }

    /// Stable hex key for logs and on-disk references
    pub fn key(&self) -> String {
        crate::idempotency::fingerprint_key(self)
    }

    /// Whether jobs created for `other` can serve this query as well.
    pub fn interchangeable_with(&self, other: &QueryFingerprint) -> bool {
        self == other
    }
}

// ============================================================================
// Job handles
// ============================================================================

/// Packaged request for a synchronous catalog service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncPayload {
    pub url: String,
    /// Catalog to read from
    pub source: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub constraints: BTreeMap<String, String>,
    pub row_limit: u64,
}

/// Reference to one submitted query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobHandle {
    /// Server-side job; must be deleted when no longer needed
    RemoteAsync {
        service: String,
        locator: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        destruction: Option<DateTime<Utc>>,
    },
    RemoteSync { payload: SyncPayload },
    Local {
        database: String,
        catalog: String,
        sql: String,
    },
}

impl JobHandle {
    pub fn kind(&self) -> BackendKind {
        match self {
            JobHandle::RemoteAsync { .. } => BackendKind::RemoteAsync,
            JobHandle::RemoteSync { .. } => BackendKind::RemoteSync,
            JobHandle::Local { .. } => BackendKind::Local,
        }
    }

    /// True when the remote job will be destroyed within `margin` of `now`.
    ///
    /// Handles without a server-side lifetime never expire.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        match self {
            JobHandle::RemoteAsync {
                destruction: Some(at),
                ..
            } => *at - margin <= now,
            _ => false,
        }
    }

    /// Short human-readable description for log messages
    pub fn describe(&self) -> String {
        match self {
            JobHandle::RemoteAsync { locator, .. } => format!("URL {}", locator),
            JobHandle::RemoteSync { payload } => format!("{} ({})", payload.source, payload.url),
            JobHandle::Local { catalog, .. } => format!("local table {}", catalog),
        }
    }
}

// ============================================================================
// Process log
// ============================================================================

/// State carried by each progress log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Run,
    End,
    Error,
    Abort,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Run => "run",
            ProcessState::End => "end",
            ProcessState::Error => "error",
            ProcessState::Abort => "abort",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessState::Run)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a run's progress log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessLogEntry {
    /// Seconds since the run started
    pub time: f64,
    pub state: ProcessState,
    /// Coarse stage progress (0..=100)
    pub percent: u8,
    pub message: String,
}

impl ProcessLogEntry {
    pub fn new(time: f64, state: ProcessState, percent: u8, message: impl Into<String>) -> Self {
        Self {
            time,
            state,
            percent: percent.min(100),
            message: message.into(),
        }
    }

    /// Percentage-only entries are replaced in place by their successor.
    pub fn is_progress(&self) -> bool {
        self.state == ProcessState::Run && self.message.starts_with(PROGRESS_PREFIX)
    }
}

/// Format a transfer percentage as a replaceable progress message.
pub fn progress_message(label: &str, percent: f64) -> String {
    format!("{}{}: {:.1}%", PROGRESS_PREFIX, label, percent)
}

// ============================================================================
// Pipeline parameters
// ============================================================================

/// Longitude/latitude column names of one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordColumns {
    pub lon: String,
    pub lat: String,
}

/// Pixel grid of the output raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapGeometry {
    pub frame: Frame,
    pub naxis1: u32,
    pub naxis2: u32,
    pub crpix1: f64,
    pub crpix2: f64,
    pub crval1: f64,
    pub crval2: f64,
    /// Pixel size in arcseconds
    pub scale: f64,
    #[serde(default = "default_projection")]
    pub projection: String,
}

fn default_projection() -> String {
    "TAN".to_string()
}

/// Input parameters of one pipeline run, persisted in the checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineParams {
    /// Expected number of science field objects
    #[serde(default)]
    pub expected_primary: Option<u64>,
    /// Expected number of control field objects
    #[serde(default)]
    pub expected_reference: Option<u64>,
    pub coords: BTreeMap<Frame, CoordColumns>,
    pub map: MapGeometry,
    #[serde(default)]
    pub products: Vec<String>,
    /// Opaque settings for the computation stages
    #[serde(default)]
    pub options: serde_json::Value,
}

impl PipelineParams {
    pub fn expected(&self, step: Step) -> Option<u64> {
        match step {
            Step::Primary => self.expected_primary,
            Step::Reference => self.expected_reference,
        }
    }

    /// Coordinate columns to use for the map frame, falling back to whichever
    /// frame the catalog provides.
    pub fn coords_for_map(&self) -> Option<(Frame, &CoordColumns)> {
        self.coords
            .get(&self.map.frame)
            .map(|c| (self.map.frame, c))
            .or_else(|| self.coords.iter().next().map(|(f, c)| (*f, c)))
    }
}

/// Everything a headless run needs: parameters plus both steps' job handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session: SessionId,
    pub params: PipelineParams,
    #[serde(default)]
    pub primary_jobs: Vec<JobHandle>,
    #[serde(default)]
    pub reference_jobs: Vec<JobHandle>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn jobs(&self, step: Step) -> &[JobHandle] {
        match step {
            Step::Primary => &self.primary_jobs,
            Step::Reference => &self.reference_jobs,
        }
    }
}
