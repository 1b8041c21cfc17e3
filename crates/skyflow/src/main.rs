//! SkyFlow command line driver
//!
//! Runs the star-count pipeline over catalog queries described in a JSON
//! job file, and gives access to the engine's maintenance operations:
//! - **run**: submit both queries, start the pipeline and follow its log
//! - **resume**: rerun a saved checkpoint in the foreground
//! - **extract**: cut one plane out of a result cube
//! - **check**: estimate the objects in the job's regions from density maps
//! - **probe**: check that the job's services and catalogs answer
//! - **sweep**: remove stale session files

mod job;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use skyflow_engine::raster::{self, PLANES};
use skyflow_engine::{Area, HealpixMap, Supervisor};
use skyflow_logging::{init_logging, LogConfig};
use skyflow_protocol::paths::{default_density_dir, default_logs_dir, default_work_dir};
use skyflow_protocol::{EngineConfig, ProcessLogEntry, ProcessState, SessionId, Step};
use tracing::{error, info};

use crate::job::JobFile;

/// Log polling interval while following a run
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "skyflow", about = "Catalog query and star-count map pipeline")]
struct Cli {
    /// Enable verbose logging (info/debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Directory for session files
    #[arg(long, global = true, env = "SKYFLOW_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Directory for the rolling log file
    #[arg(long, global = true, env = "SKYFLOW_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Directory of HEALPix density maps (<dataset>.hpx)
    #[arg(long, global = true, env = "SKYFLOW_DENSITY_DIR")]
    density_dir: Option<PathBuf>,

    /// Number of pipeline worker threads
    #[arg(long, global = true, env = "SKYFLOW_POOL_SIZE")]
    pool_size: Option<usize>,

    /// Attempts per job before a retrieval gives up
    #[arg(long, global = true, env = "SKYFLOW_MAX_FAILURES")]
    max_failures: Option<u32>,

    /// Always download results, ignoring cached tables
    #[arg(long, global = true)]
    no_cache: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job file's queries and run the pipeline
    Run {
        /// JSON job description
        #[arg(short, long)]
        job: PathBuf,

        /// Planes to save as standalone images once the run ends
        #[arg(short = 'x', long = "extract")]
        planes: Vec<String>,

        /// Directory for extracted planes
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Run the pipeline of a saved checkpoint in the foreground
    Resume {
        /// Checkpoint file (process_<id>.json)
        checkpoint: PathBuf,
    },

    /// Save one plane of a result cube as a standalone image
    Extract {
        /// Result cube (process_<id>.fits)
        cube: PathBuf,

        /// Plane name, e.g. ext_map
        plane: String,

        /// Output file (default: <plane>.fits)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Estimate the objects in the regions of a job file
    Check {
        #[arg(short, long)]
        job: PathBuf,
    },

    /// Check that the services and catalogs of a job file answer
    Probe {
        #[arg(short, long)]
        job: PathBuf,
    },

    /// Remove session files older than the stale grace period
    Sweep,
}

impl Cli {
    fn engine_config(&self) -> EngineConfig {
        let mut config =
            EngineConfig::with_work_dir(self.work_dir.clone().unwrap_or_else(default_work_dir));
        if let Some(size) = self.pool_size {
            config.pool_size = size.max(1);
        }
        if let Some(n) = self.max_failures {
            config.max_failures = n.max(1);
        }
        config.use_cache = !self.no_cache;
        config
    }

    fn density_dir(&self) -> PathBuf {
        self.density_dir.clone().unwrap_or_else(default_density_dir)
    }
}

fn format_entry(entry: &ProcessLogEntry) -> String {
    format!(
        "{:8.1}s {:5} {:3}% {}",
        entry.time,
        entry.state.as_str(),
        entry.percent,
        entry.message
    )
}

/// Print the run's log as it grows until the run is over; returns the
/// terminal entry.
fn follow(supervisor: &Supervisor, session: &SessionId) -> Result<ProcessLogEntry> {
    let mut shown = 0usize;
    let mut last_line = String::new();
    loop {
        let done = supervisor.wait_for_run(session, POLL_INTERVAL);
        let log = supervisor.monitor(session).log;
        // The last shown entry may have been replaced by a newer percentage
        for (i, entry) in log.iter().enumerate().skip(shown.saturating_sub(1)) {
            let line = format_entry(entry);
            if i + 1 == shown && line == last_line {
                continue;
            }
            println!("{}", line);
            last_line = line;
        }
        shown = log.len();
        match log.last() {
            Some(last) if last.state.is_terminal() => return Ok(last.clone()),
            _ if done => bail!("The run of session {} ended without a final state", session),
            _ => {}
        }
    }
}

fn write_plane(supervisor: &Supervisor, session: &SessionId, plane: &str, out: &Path) -> Result<()> {
    let artifact = format!("{}.fits", plane);
    let bytes = supervisor
        .download(&artifact, session)
        .with_context(|| format!("Cannot extract plane {}", plane))?;
    let path = out.join(&artifact);
    fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Saved {}", path.display());
    Ok(())
}

fn density_map(density_dir: &Path, dataset: &str) -> Result<HealpixMap> {
    HealpixMap::open_dataset(density_dir, dataset)
        .with_context(|| format!("Cannot load density map {}", dataset))
}

fn cmd_run(
    config: EngineConfig,
    density_dir: &Path,
    job_path: &Path,
    planes: &[String],
    out: &Path,
) -> Result<()> {
    let job = JobFile::load(job_path)?;
    let session = job.session()?;
    let supervisor = Supervisor::with_defaults(config)?;
    let mut params = job.params.clone();

    for step in Step::ALL {
        let fingerprint = job.fingerprint(step)?;
        let spec = job.step(step);
        let handles = match &spec.density {
            Some(dataset) => {
                let map = density_map(density_dir, dataset)?;
                let area = Area::Box(spec.region.clone());
                let reply = supervisor.check_area(&map, &area, Some((&session, step, &fingerprint)));
                println!("{}: {}", step.label(), reply.message.content);
                if !reply.message.is_success() {
                    bail!("{} of the {} query failed", reply.message.header, step.label());
                }
                let expected = match step {
                    Step::Primary => &mut params.expected_primary,
                    Step::Reference => &mut params.expected_reference,
                };
                expected.get_or_insert(reply.estimate.round() as u64);
                reply.handles
            }
            None => supervisor.submit_query(&session, step, &fingerprint),
        };
        if handles.is_empty() {
            bail!(
                "Cannot submit the {} query to {}",
                step.label(),
                fingerprint.backend
            );
        }
        info!("{}: {} jobs", step.label(), handles.len());
    }

    let reply = supervisor.start_process(&session, Some(params));
    if !reply.message.is_success() {
        bail!("{}: {}", reply.message.header, reply.message.content);
    }
    println!("Session {}", session);

    let last = follow(&supervisor, &session)?;
    if last.state != ProcessState::End {
        bail!("Pipeline did not complete: {}", last.message);
    }
    if !planes.is_empty() {
        fs::create_dir_all(out)
            .with_context(|| format!("Failed to create {}", out.display()))?;
    }
    for plane in planes {
        write_plane(&supervisor, &session, plane, out)?;
    }
    println!("Result cube: {}", supervisor.files(&session).artifact.display());
    Ok(())
}

fn cmd_resume(config: EngineConfig, checkpoint: &Path) -> Result<()> {
    let supervisor = Supervisor::with_defaults(config)?;
    let entries = supervisor.resume(checkpoint).context("Resumed run failed")?;
    for entry in entries.iter().filter(|e| !e.is_progress()) {
        println!("{}", format_entry(entry));
    }
    Ok(())
}

fn cmd_extract(cube: &Path, plane: &str, out: Option<PathBuf>) -> Result<()> {
    let name = format!("{}.fits", plane);
    let index = raster::plane_index(&name)
        .with_context(|| format!("Unknown plane {} (expected one of {})", plane, PLANES.join(", ")))?;
    let bytes = raster::extract_plane_from_file(cube, index)?;
    let out = out.unwrap_or_else(|| PathBuf::from(&name));
    fs::write(&out, bytes).with_context(|| format!("Failed to write {}", out.display()))?;
    println!("Saved {}", out.display());
    Ok(())
}

fn cmd_check(config: EngineConfig, density_dir: &Path, job_path: &Path) -> Result<()> {
    let job = JobFile::load(job_path)?;
    let supervisor = Supervisor::with_defaults(config)?;
    let mut failed = false;
    for step in Step::ALL {
        let spec = job.step(step);
        let Some(dataset) = &spec.density else {
            println!("{}: no density map", step.label());
            continue;
        };
        let map = density_map(density_dir, dataset)?;
        let reply = supervisor.check_area(&map, &Area::Box(spec.region.clone()), None);
        println!("{}: {}: {}", step.label(), reply.message.header, reply.message.content);
        failed |= !reply.message.is_success();
    }
    if failed {
        bail!("Area check failed");
    }
    Ok(())
}

fn cmd_probe(config: EngineConfig, job_path: &Path) -> Result<()> {
    let job = JobFile::load(job_path)?;
    let supervisor = Supervisor::with_defaults(config)?;
    let mut failed = false;
    for step in Step::ALL {
        let spec = job.step(step);
        let message = supervisor.probe(&spec.backend, &spec.catalogs, &spec.fields, &spec.conditions);
        println!("{}: {}: {}", step.label(), message.header, message.content);
        failed |= !message.is_success();
    }
    if failed {
        bail!("Probe failed");
    }
    Ok(())
}

fn cmd_sweep(config: EngineConfig) -> Result<()> {
    let supervisor = Supervisor::with_defaults(config)?;
    let removed = supervisor.sweep_stale()?;
    println!("Removed {} stale files", removed);
    Ok(())
}

fn run_command(cli: Cli) -> Result<()> {
    let config = cli.engine_config();
    let density_dir = cli.density_dir();
    match cli.command {
        Commands::Run { job, planes, out } => cmd_run(config, &density_dir, &job, &planes, &out),
        Commands::Resume { checkpoint } => cmd_resume(config, &checkpoint),
        Commands::Extract { cube, plane, out } => cmd_extract(&cube, &plane, out),
        Commands::Check { job } => cmd_check(config, &density_dir, &job),
        Commands::Probe { job } => cmd_probe(config, &job),
        Commands::Sweep => cmd_sweep(config),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_dir = cli.log_dir.clone().unwrap_or_else(default_logs_dir);
    let _log_guard = match init_logging(LogConfig {
        app_name: "skyflow",
        verbose: cli.verbose,
        log_dir: Some(log_dir),
    }) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Warning: {:#}", err);
            None
        }
    };

    match run_command(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_config_flags() {
        let cli = Cli::parse_from([
            "skyflow",
            "--work-dir",
            "/tmp/sky",
            "--pool-size",
            "0",
            "--no-cache",
            "--density-dir",
            "/data/hips",
            "sweep",
        ]);
        let config = cli.engine_config();
        assert_eq!(config.work_dir, PathBuf::from("/tmp/sky"));
        assert_eq!(config.pool_size, 1);
        assert!(!config.use_cache);
        assert_eq!(cli.density_dir(), PathBuf::from("/data/hips"));
    }

    #[test]
    fn test_format_entry() {
        let entry = ProcessLogEntry::new(1.5, ProcessState::Run, 8, "5 objects found");
        assert_eq!(format_entry(&entry), "     1.5s run     8% 5 objects found");
    }
}
