//! Job & pipeline orchestration engine of SkyFlow.
//!
//! # Architecture
//!
//! ```text
//!   control calls ──► Supervisor ──► JobRegistry ──► CatalogClient ──► TAP / VizieR / SQLite
//!                        │   ▲                           ▲
//!                        │   └── LogCore (progress log)  │
//!                        ▼                               │
//!                   WorkerPool ──► stages ──► Retriever ─┴──► ResultCache (Parquet)
//! ```
//!
//! - **catalog**: submit/fetch/cancel over remote-async, remote-sync and
//!   local backends, plus region query building
//! - **table**: VOTable and FITS BINTABLE decoding into Arrow record batches
//! - **retriever**: chunked download with progress estimates, retries and
//!   result caching
//! - **registry**: per-session, per-step job bookkeeping
//! - **density**: object count estimates from HEALPix density maps
//! - **core**: the progress-log actor
//! - **supervisor**: the per-session process state machine
//!
//! Runs are synchronous code on plain threads; cancellation is cooperative
//! through [`CancellationToken`] and the log's refusal of late entries.

pub mod cache;
pub mod cancel;
pub mod catalog;
pub mod core;
pub mod density;
pub mod error;
pub mod pool;
pub mod progress;
pub mod raster;
pub mod registry;
pub mod retriever;
pub mod stages;
pub mod supervisor;
pub mod table;

pub use cache::{CacheStats, ResultCache};
pub use cancel::{CancellationToken, Cancelled};
pub use catalog::query::{Condition, SkyRegion};
pub use catalog::{
    AsyncJobService, CatalogClient, Connector, DefaultConnector, JobPhase, LocalQueryEngine,
    ResultStream, SubmittedJob, SyncQueryService,
};
pub use density::{Area, DensityMap, HealpixMap};
pub use error::{CatalogError, ControlError, PipelineError, RetrieveError};
pub use registry::{JobRegistry, SessionJobs, StepState};
pub use retriever::{ProgressSink, Retriever};
pub use stages::{PipelineStages, Stage, StageContext, StarCountPipeline};
pub use supervisor::Supervisor;
pub use table::{Table, TableError};
