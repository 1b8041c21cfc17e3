//! End-to-end orchestration tests against scripted catalog backends.
//!
//! Every test drives a real [`Supervisor`] (log core, worker pool, cache
//! and artifact files in a temp dir); only the catalog services are
//! scripted.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use skyflow_engine::density::{Area, HealpixMap, PixelOrdering};
use skyflow_engine::raster::PLANES;
use skyflow_engine::table::fits;
use skyflow_engine::{
    CacheStats, ControlError, JobPhase, PipelineStages, SkyRegion, Stage, StageContext,
    StarCountPipeline, Supervisor,
};
use skyflow_protocol::{
    BackendId, Constraints, Frame, PipelineParams, ProcessLogEntry, ProcessState,
    QueryFingerprint, SessionId, Step,
};
use tempfile::TempDir;

const RUN_TIMEOUT: Duration = Duration::from_secs(20);

fn run_to_end(supervisor: &Supervisor, session: &SessionId) -> Vec<ProcessLogEntry> {
    let reply = supervisor.start_process(session, Some(params()));
    assert!(reply.message.is_success(), "{:?}", reply.message);
    assert!(supervisor.wait_for_run(session, RUN_TIMEOUT), "run did not finish");
    supervisor.monitor(session).log
}

fn submit_star_queries(supervisor: &Supervisor, session: &SessionId) {
    let primary = supervisor.submit_query(session, Step::Primary, &tap_query("sci", "glat > -5"));
    assert_eq!(primary.len(), 1);
    let reference =
        supervisor.submit_query(session, Step::Reference, &tap_query("ctl", "glat > -5"));
    assert_eq!(reference.len(), 1);
}

fn count(log: &[ProcessLogEntry], state: ProcessState) -> usize {
    log.iter().filter(|e| e.state == state).count()
}

fn has_message(log: &[ProcessLogEntry], needle: &str) -> bool {
    log.iter().any(|e| e.message.contains(needle))
}

// =============================================================================
// Job submission
// =============================================================================

mod submission {
    use super::*;

    #[test]
    fn test_same_query_is_not_resubmitted() {
        let dir = TempDir::new().unwrap();
        let tap = star_tap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(tap.clone()),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        let query = tap_query("sci", "glat > -5");

        let first = supervisor.submit_query(&session, Step::Primary, &query);
        let second = supervisor.submit_query(&session, Step::Primary, &query);
        assert_eq!(first, second);
        assert_eq!(tap.submits(), 1);
    }

    #[test]
    fn test_changed_constraints_replace_the_job() {
        let dir = TempDir::new().unwrap();
        let tap = star_tap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(tap.clone()),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();

        let first = supervisor.submit_query(&session, Step::Primary, &tap_query("sci", "glat > -5"));
        let second =
            supervisor.submit_query(&session, Step::Primary, &tap_query("sci", "glat > -4"));
        assert_ne!(first, second);
        assert_eq!(tap.submits(), 2);
        assert!(wait_until(Duration::from_secs(5), || tap.deleted().len() == 1));
        assert!(tap.deleted()[0].ends_with("job1"));
    }

    #[test]
    fn test_local_resubmission_runs_no_query() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("stars.db");
        let mut rows = reference_rows();
        rows.extend(science_rows());
        star_database(&db, &rows);
        let engine = CountingEngine::open(&db);
        let supervisor = supervisor(
            &dir.path().join("work"),
            ScriptedConnector {
                local: Some(engine.clone()),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        let query = QueryFingerprint::new(
            BackendId::Local {
                database: db.display().to_string(),
            },
            vec!["stars".into()],
            vec!["glon".into(), "glat".into()],
            Constraints::Expression("glat > -5".into()),
        );

        let first = supervisor.submit_query(&session, Step::Primary, &query);
        let second = supervisor.submit_query(&session, Step::Primary, &query);
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
        assert_eq!(engine.executes(), 0);

        // The control field shares the science field's query
        let reference = supervisor.submit_query(&session, Step::Reference, &query);
        assert_eq!(reference, first);

        let log = run_to_end(&supervisor, &session);
        assert_eq!(log.last().unwrap().state, ProcessState::End);
        assert_eq!(engine.executes(), 2);
        assert!(has_message(&log, "8 objects found"));
    }

    #[test]
    fn test_steps_share_identical_queries() {
        let dir = TempDir::new().unwrap();
        let tap = star_tap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(tap.clone()),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        let query = tap_query("ctl", "glat > -5");

        let reference = supervisor.submit_query(&session, Step::Reference, &query);
        let primary = supervisor.submit_query(&session, Step::Primary, &query);
        assert_eq!(primary, reference);
        assert_eq!(tap.submits(), 1);

        // Moving the science field away must not release the shared job
        supervisor.submit_query(&session, Step::Primary, &tap_query("sci", "glat > -5"));
        assert_eq!(tap.submits(), 2);
        std::thread::sleep(Duration::from_millis(100));
        assert!(tap.deleted().is_empty());
    }

    #[test]
    fn test_failed_submission_returns_no_handles() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector::default(),
            Arc::new(StarCountPipeline),
        );
        let handles =
            supervisor.submit_query(&SessionId::new(), Step::Primary, &tap_query("sci", ""));
        assert!(handles.is_empty());
    }

    #[test]
    fn test_probe() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(star_tap()),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let backend = BackendId::RemoteAsync {
            url: TAP_URL.into(),
        };
        let fields = vec!["glon".to_string()];

        let ok = supervisor.probe(&backend, &["sci".into()], &fields, &[]);
        assert_eq!(ok.header, "Server checked");
        let missing = supervisor.probe(&backend, &["sci".into(), "nope".into()], &fields, &[]);
        assert_eq!(missing.header, "Catalog unavailable");
        assert!(!missing.is_success());
    }

    #[test]
    fn test_area_check_gates_submission() {
        let dir = TempDir::new().unwrap();
        let tap = star_tap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(tap.clone()),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        let density = |per_pixel: f64| {
            HealpixMap::new(1, PixelOrdering::Ring, Frame::Galactic, vec![per_pixel; 12]).unwrap()
        };
        let sky = Area::Box(SkyRegion {
            frame: Frame::Galactic,
            lon_min: 0.0,
            lon_max: 360.0,
            lat_min: -90.0,
            lat_max: 90.0,
        });
        let query = tap_query("sci", "glat > -5");

        let crowded =
            supervisor.check_area(&density(1.0e6), &sky, Some((&session, Step::Primary, &query)));
        assert!(!crowded.message.is_success());
        assert!(crowded.message.content.contains("too many stars (~12.0 millions)"));
        assert!(crowded.handles.is_empty());
        assert_eq!(tap.submits(), 0);

        let fine =
            supervisor.check_area(&density(1000.0), &sky, Some((&session, Step::Primary, &query)));
        assert_eq!(fine.message.header, "Area checked");
        assert_eq!(
            fine.message.content,
            "The area contains an appropriate number of stars (~12.0 thousands)."
        );
        assert_eq!(fine.estimate, 12_000.0);
        assert_eq!(fine.handles.len(), 1);
        assert_eq!(tap.submits(), 1);

        let sparse = supervisor.check_area(&density(10.0), &sky, None);
        assert!(sparse.message.content.contains("too few stars (~120)"));
        assert!(sparse.handles.is_empty());

        let icrs = Area::Disk {
            frame: Frame::Icrs,
            lon: 0.0,
            lat: 0.0,
            radius: 1.0,
        };
        let failed = supervisor.check_area(&density(1000.0), &icrs, None);
        assert_eq!(failed.message.header, "Area check failed");
        assert_eq!(tap.submits(), 1);
    }
}

// =============================================================================
// Runs
// =============================================================================

mod runs {
    use super::*;

    #[test]
    fn test_run_reports_stages_and_ends() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(star_tap()),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        submit_star_queries(&supervisor, &session);

        let log = run_to_end(&supervisor, &session);
        let first = &log[0];
        assert_eq!(first.message, format!("Starting (session id: {})", session));
        assert!(has_message(&log, "expecting 5 objects"));
        assert!(has_message(&log, "5 objects found"));
        assert!(has_message(&log, "3 objects found"));
        assert!(has_message(&log, "Map making"));

        let last = log.last().unwrap();
        assert_eq!(last.state, ProcessState::End);
        assert_eq!(last.percent, 100);
        assert_eq!(last.message, "Process completed");
        assert_eq!(count(&log, ProcessState::End), 1);
        assert!(log.windows(2).all(|w| w[0].time <= w[1].time));
        assert!(log.windows(2).all(|w| w[0].percent <= w[1].percent));

        let files = supervisor.files(&session);
        assert!(files.artifact.exists());
        assert!(files.checkpoint.exists());
        assert!(files.execution_log.exists());
    }

    #[test]
    fn test_pending_jobs_are_polled_again() {
        let dir = TempDir::new().unwrap();
        let tap = star_tap();
        tap.script(vec![JobPhase::Pending("QUEUED".into()); 4]);
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(tap.clone()),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        submit_star_queries(&supervisor, &session);

        let log = run_to_end(&supervisor, &session);
        assert_eq!(log.last().unwrap().state, ProcessState::End);
        let retries = log
            .iter()
            .filter(|e| e.message == "Job still in phase QUEUED: trying again")
            .count();
        assert_eq!(retries, 4);
        assert_eq!(tap.waits(), 6);
        assert_eq!(tap.opens(), 2);
        assert!(supervisor.files(&session).cache(Step::Reference).exists());
    }

    #[test]
    fn test_transport_failures_stop_at_the_ceiling() {
        let dir = TempDir::new().unwrap();
        let tap = star_tap();
        tap.break_transfers();
        let mut config = config(dir.path());
        config.max_failures = 3;
        let supervisor = Supervisor::new(
            config,
            Arc::new(ScriptedConnector {
                tap: Some(tap.clone()),
                ..Default::default()
            }),
            Arc::new(StarCountPipeline),
        )
        .unwrap();
        let session = SessionId::new();
        submit_star_queries(&supervisor, &session);

        let log = run_to_end(&supervisor, &session);
        assert_eq!(tap.opens(), 3);
        assert!(has_message(&log, "Cannot retrieve the data after 3 tries"));
        let last = log.last().unwrap();
        assert_eq!(last.state, ProcessState::Error);
        assert!(last.message.starts_with("Error: CatalogError\n"));
        assert!(!supervisor.files(&session).cache(Step::Reference).exists());
    }

    #[test]
    fn test_schema_mismatch_is_fatal() {
        let dir = TempDir::new().unwrap();
        let tap = star_tap();
        tap.with_catalog("odd", votable(&["x", "y"], &[vec![1.0, 2.0]]));
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(tap.clone()),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        let mixed = QueryFingerprint::new(
            BackendId::RemoteAsync {
                url: TAP_URL.into(),
            },
            vec!["sci".into(), "odd".into()],
            vec![],
            Constraints::Expression(String::new()),
        );
        supervisor.submit_query(&session, Step::Primary, &mixed);
        supervisor.submit_query(&session, Step::Reference, &tap_query("ctl", "glat > -5"));

        let log = run_to_end(&supervisor, &session);
        let last = log.last().unwrap();
        assert_eq!(last.state, ProcessState::Error);
        assert!(last.message.starts_with("Error: SchemaMismatch\n"));
        assert_eq!(last.percent, 68);
        assert_eq!(tap.opens(), 3);
        assert!(!has_message(&log, "trying again"));
        assert!(!supervisor.files(&session).cache(Step::Primary).exists());
    }

    #[test]
    fn test_download_progress_collapses() {
        let dir = TempDir::new().unwrap();
        let tap = star_tap();
        let many: Vec<Vec<f64>> = (0..200)
            .map(|i| vec![9.0 + (i % 20) as f64 * 0.1, -1.0 + (i / 20) as f64 * 0.2])
            .collect();
        tap.with_catalog("sci", votable(&["glon", "glat"], &many));
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(tap),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        submit_star_queries(&supervisor, &session);

        let log = run_to_end(&supervisor, &session);
        assert_eq!(log.last().unwrap().state, ProcessState::End);
        assert!(log.iter().any(ProcessLogEntry::is_progress));
        assert!(log
            .windows(2)
            .all(|w| !(w[0].is_progress() && w[1].is_progress())));
        assert!(has_message(&log, "200 objects found"));
    }

    #[test]
    fn test_restart_reads_the_cache() {
        let dir = TempDir::new().unwrap();
        let tap = star_tap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(tap.clone()),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        submit_star_queries(&supervisor, &session);
        run_to_end(&supervisor, &session);
        assert_eq!(tap.opens(), 2);

        let reply = supervisor.start_process(&session, None);
        assert!(reply.message.is_success());
        assert!(supervisor.wait_for_run(&session, RUN_TIMEOUT));
        let log = supervisor.monitor(&session).log;
        assert_eq!(log.last().unwrap().state, ProcessState::End);
        assert!(has_message(&log, "Using cached results"));
        assert_eq!(tap.opens(), 2);
        assert_eq!(
            supervisor.cache_stats(),
            CacheStats {
                hits: 2,
                writes: 2
            }
        );
    }

    #[test]
    fn test_restart_without_parameters_fails() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector::default(),
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        let reply = supervisor.start_process(&session, None);
        assert_eq!(reply.message.header, "Pipeline error");
        assert!(reply
            .message
            .content
            .starts_with(&format!("Error starting the pipeline for session ID {}", session)));
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(star_tap()),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        submit_star_queries(&supervisor, &session);
        run_to_end(&supervisor, &session);

        let files = supervisor.files(&session);
        std::fs::remove_file(&files.artifact).unwrap();
        let entries = supervisor.resume(&files.checkpoint).unwrap();
        let last = entries.last().unwrap();
        assert_eq!(last.state, ProcessState::End);
        assert_eq!(last.message, "Process completed");
        assert!(files.artifact.exists());
    }

    #[test]
    fn test_resume_rejects_a_missing_checkpoint() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector::default(),
            Arc::new(StarCountPipeline),
        );
        assert!(supervisor
            .resume(&dir.path().join("process_missing.json"))
            .is_err());
    }

    #[test]
    fn test_query_change_mid_download_leaves_no_cache() {
        let dir = TempDir::new().unwrap();
        let gate = Arc::new(Gate::default());
        let sync = HeldSyncService::new(
            votable(&["glon", "glat"], &reference_rows()),
            Arc::clone(&gate),
        );
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(star_tap()),
                sync: Some(Arc::new(sync)),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        supervisor.submit_query(&session, Step::Primary, &tap_query("sci", "glat > -5"));
        let first = supervisor.submit_query(&session, Step::Reference, &sync_query("ctl", "glat", ">-5"));
        assert_eq!(first.len(), 1);
        assert!(supervisor.start_process(&session, Some(params())).message.is_success());
        assert!(gate.wait_reached(RUN_TIMEOUT), "download did not reach the end of the body");

        let second =
            supervisor.submit_query(&session, Step::Reference, &sync_query("ctl", "glat", ">-1"));
        assert_eq!(second.len(), 1);
        assert_ne!(first, second);
        gate.open();
        // Joins the pool workers, so the stopped run has unwound
        supervisor.shutdown();

        assert!(!supervisor.files(&session).cache(Step::Reference).exists());
        assert_eq!(supervisor.cache_stats().writes, 0);
    }

    struct EmptyGrid;

    impl Stage for EmptyGrid {
        fn name(&self) -> &str {
            "grid"
        }

        fn progress(&self) -> u8 {
            30
        }

        fn run(&self, ctx: &mut StageContext<'_>) -> anyhow::Result<()> {
            ctx.report("Building the grid")?;
            let cells: Vec<f64> = Vec::new();
            let mean = cells.iter().sum::<f64>() / cells[0];
            ctx.report(&format!("Mean density {}", mean))?;
            Ok(())
        }
    }

    struct EmptyGridPipeline;

    impl PipelineStages for EmptyGridPipeline {
        fn stages(&self, _params: &PipelineParams) -> Vec<Box<dyn Stage>> {
            vec![Box::new(EmptyGrid)]
        }
    }

    #[test]
    fn test_panicking_stage_ends_in_error() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector::default(),
            Arc::new(EmptyGridPipeline),
        );
        let session = SessionId::new();
        let log = run_to_end(&supervisor, &session);

        let last = log.last().unwrap();
        assert_eq!(last.state, ProcessState::Error);
        assert_eq!(last.percent, 30);
        assert!(last.message.starts_with("Error: Panic\n"), "{}", last.message);
        assert!(last.message.contains("index out of bounds"));
        assert_eq!(count(&log, ProcessState::Error), 1);
        assert!(supervisor.monitor(&session).success);

        let err = supervisor
            .resume(&supervisor.files(&session).checkpoint)
            .unwrap_err();
        assert_eq!(err.kind(), "Panic");
    }
}

// =============================================================================
// Stop, abort and cleanup
// =============================================================================

mod control {
    use super::*;

    fn gated(dir: &std::path::Path) -> (Supervisor, Arc<Gate>, SessionId) {
        let gate = Arc::new(Gate::default());
        let supervisor = supervisor(
            dir,
            ScriptedConnector {
                tap: Some(star_tap()),
                ..Default::default()
            },
            Arc::new(GatedPipeline(Arc::clone(&gate))),
        );
        let session = SessionId::new();
        submit_star_queries(&supervisor, &session);
        let reply = supervisor.start_process(&session, Some(params()));
        assert!(reply.message.is_success());
        assert!(gate.wait_reached(RUN_TIMEOUT));
        (supervisor, gate, session)
    }

    #[test]
    fn test_stop_closes_the_log() {
        let dir = TempDir::new().unwrap();
        let (supervisor, gate, session) = gated(dir.path());

        let reply = supervisor.stop_process(&session);
        assert_eq!(reply.message.header, "Aborting");
        assert_eq!(
            reply.message.content,
            format!("Stopping process for session ID {}", session)
        );
        gate.open();
        assert!(supervisor.wait_for_run(&session, RUN_TIMEOUT));

        let log = supervisor.monitor(&session).log;
        let last = log.last().unwrap();
        assert_eq!(last.state, ProcessState::Abort);
        assert_eq!(last.percent, 50);
        assert_eq!(count(&log, ProcessState::Abort), 1);
        assert_eq!(count(&log, ProcessState::End), 0);
        assert_eq!(count(&log, ProcessState::Error), 0);
        assert!(!supervisor.files(&session).artifact.exists());

        let again = supervisor.stop_process(&session);
        assert_eq!(again.message.header, "Error");
        assert!(again
            .message
            .content
            .starts_with("Could not find running process"));
    }

    #[test]
    fn test_start_while_running_restarts() {
        let dir = TempDir::new().unwrap();
        let (supervisor, gate, session) = gated(dir.path());

        let reply = supervisor.start_process(&session, None);
        assert!(reply.message.is_success(), "{:?}", reply.message);
        assert_eq!(reply.message.header, "Connection established");
        gate.open();
        assert!(supervisor.wait_for_run(&session, RUN_TIMEOUT));

        let log = supervisor.monitor(&session).log;
        assert!(log[0].message.starts_with("Starting"));
        assert_eq!(log.last().unwrap().state, ProcessState::End);
        assert_eq!(count(&log, ProcessState::End), 1);
        assert_eq!(count(&log, ProcessState::Abort), 0);
        assert!(supervisor.files(&session).artifact.exists());

        // Both runs write the execution log; only the second one may end
        supervisor.shutdown();
        let lines = std::fs::read_to_string(&supervisor.files(&session).execution_log).unwrap();
        let ends = lines
            .lines()
            .filter(|line| line.split_whitespace().nth(1) == Some("end"))
            .count();
        assert_eq!(ends, 1, "{}", lines);
    }

    #[test]
    fn test_query_change_discards_the_run() {
        let dir = TempDir::new().unwrap();
        let (supervisor, gate, session) = gated(dir.path());

        supervisor.submit_query(&session, Step::Primary, &tap_query("sci", "glat > -1"));
        gate.open();

        let monitor = supervisor.monitor(&session);
        assert!(!monitor.success);
        assert!(monitor.log.is_empty());
        assert!(!supervisor.files(&session).checkpoint.exists());
        assert!(!supervisor.wait_for_run(&session, Duration::from_millis(10)));
    }

    #[test]
    fn test_full_abort_removes_everything() {
        let dir = TempDir::new().unwrap();
        let tap = star_tap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(tap.clone()),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        submit_star_queries(&supervisor, &session);
        run_to_end(&supervisor, &session);

        let reply = supervisor.abort_process(&session, false);
        assert_eq!(reply.message.header, "Aborting");
        assert_eq!(
            reply.message.content,
            format!("Aborting process for session ID {}", session)
        );
        for path in supervisor.files(&session).all() {
            assert!(!path.exists(), "{} survived", path.display());
        }
        assert!(wait_until(Duration::from_secs(5), || tap.deleted().len() == 2));
        assert!(!supervisor.monitor(&session).success);
        assert_eq!(supervisor.session_count(), 0);

        let again = supervisor.abort_process(&session, true);
        assert_eq!(again.message.header, "Error");
        assert!(again
            .message
            .content
            .starts_with("Could not find any process"));
        assert_eq!(supervisor.session_count(), 0);
    }

    #[test]
    fn test_sweep_keeps_foreign_files() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.stale_grace = Duration::ZERO;
        let tap = star_tap();
        let supervisor = Supervisor::new(
            config,
            Arc::new(ScriptedConnector {
                tap: Some(tap.clone()),
                ..Default::default()
            }),
            Arc::new(StarCountPipeline),
        )
        .unwrap();
        let session = SessionId::new();
        submit_star_queries(&supervisor, &session);
        run_to_end(&supervisor, &session);
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();
        assert_eq!(supervisor.session_count(), 1);

        assert_eq!(supervisor.sweep_stale().unwrap(), 5);
        assert!(dir.path().join("notes.txt").exists());
        // The swept session is forgotten along with its jobs
        assert_eq!(supervisor.session_count(), 0);
        assert!(!supervisor.monitor(&session).success);
        assert!(wait_until(Duration::from_secs(5), || tap.deleted().len() == 2));
    }
}

// =============================================================================
// Artifact download
// =============================================================================

mod download {
    use super::*;

    #[test]
    fn test_plane_images() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector {
                tap: Some(star_tap()),
                ..Default::default()
            },
            Arc::new(StarCountPipeline),
        );
        let session = SessionId::new();
        submit_star_queries(&supervisor, &session);
        run_to_end(&supervisor, &session);

        let image = supervisor.download("ext_map.fits", &session).unwrap();
        assert_eq!(image.len() % fits::BLOCK, 0);
        let (header, _) = fits::parse_header(&image, 0).unwrap();
        assert_eq!(header.int("NAXIS"), Some(2));
        assert_eq!(header.int("NAXIS1"), Some(4));
        assert!(header.get("NAXIS3").is_none());
        assert!(header.get("DATASUM").is_none());
        assert_eq!(header.string("BUNIT"), Some("mag"));
        assert_eq!(header.string("CTYPE1"), Some("GLON-TAN"));

        assert!(matches!(
            supervisor.download(&format!("{}.fits", PLANES[4]), &session),
            Err(ControlError::MissingPlane(_))
        ));
        assert!(matches!(
            supervisor.download("secret.fits", &session),
            Err(ControlError::UnknownArtifact(_))
        ));
    }

    #[test]
    fn test_download_without_artifact() {
        let dir = TempDir::new().unwrap();
        let supervisor = supervisor(
            dir.path(),
            ScriptedConnector::default(),
            Arc::new(StarCountPipeline),
        );
        assert!(supervisor.download("weight.fits", &SessionId::new()).is_err());
    }
}
