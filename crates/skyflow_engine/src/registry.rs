//! Per-session bookkeeping of submitted query jobs.
//!
//! Each (session, step) has at most one [`StepState`]: the fingerprint a
//! step was submitted with and the handles that came back. Re-submitting
//! the same fingerprint is a no-op as long as the remote jobs are not about
//! to be destroyed; anything else replaces the state, releasing the old
//! jobs first.

use std::sync::Arc;
use std::thread;

use chrono::{Duration, Utc};
use skyflow_protocol::{JobHandle, QueryFingerprint, SessionId, Step};
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::catalog::CatalogClient;

/// Registered query of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepState {
    pub fingerprint: QueryFingerprint,
    pub handles: Vec<JobHandle>,
}

/// Query state of both steps of a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionJobs {
    primary: Option<StepState>,
    reference: Option<StepState>,
}

impl SessionJobs {
    pub fn get(&self, step: Step) -> Option<&StepState> {
        match step {
            Step::Primary => self.primary.as_ref(),
            Step::Reference => self.reference.as_ref(),
        }
    }

    fn slot(&mut self, step: Step) -> &mut Option<StepState> {
        match step {
            Step::Primary => &mut self.primary,
            Step::Reference => &mut self.reference,
        }
    }

    /// Handles registered for a step, empty when there are none.
    pub fn handles(&self, step: Step) -> Vec<JobHandle> {
        self.get(step)
            .map(|state| state.handles.clone())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.reference.is_none()
    }
}

/// How a submission request can be served.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Same fingerprint already registered for the step
    Existing(Vec<JobHandle>),
    /// Same fingerprint registered for the other step
    Adopted(Vec<JobHandle>),
    /// New jobs are needed
    Fresh,
}

pub struct JobRegistry {
    catalog: Arc<CatalogClient>,
    cache: Arc<ResultCache>,
    expiry_margin: Duration,
}

impl JobRegistry {
    pub fn new(catalog: Arc<CatalogClient>, cache: Arc<ResultCache>, expiry_margin: Duration) -> Self {
        Self {
            catalog,
            cache,
            expiry_margin,
        }
    }

    fn reusable(&self, state: &StepState, fingerprint: &QueryFingerprint) -> bool {
        let now = Utc::now();
        state.fingerprint.interchangeable_with(fingerprint)
            && !state.handles.is_empty()
            && !state
                .handles
                .iter()
                .any(|h| h.expires_within(now, self.expiry_margin))
    }

    pub fn resolve(&self, jobs: &SessionJobs, step: Step, fingerprint: &QueryFingerprint) -> Resolution {
        if let Some(state) = jobs.get(step) {
            if self.reusable(state, fingerprint) {
                return Resolution::Existing(state.handles.clone());
            }
        }
        if let Some(other) = jobs.get(step.other()) {
            if self.reusable(other, fingerprint) {
                return Resolution::Adopted(other.handles.clone());
            }
        }
        Resolution::Fresh
    }

    /// Handles serving `fingerprint` for the step; empty when the jobs could
    /// not be submitted.
    ///
    /// `on_replace` runs whenever the step's registration changes, before
    /// the previous jobs are released and their cache dropped. A run still
    /// reading the old results must be stopped by then.
    pub fn execute(
        &self,
        jobs: &mut SessionJobs,
        session: &SessionId,
        step: Step,
        fingerprint: &QueryFingerprint,
        on_replace: impl FnOnce(),
    ) -> Vec<JobHandle> {
        let key = fingerprint.key();
        let short = skyflow_protocol::idempotency::short_key(&key);
        match self.resolve(jobs, step, fingerprint) {
            Resolution::Existing(handles) => {
                debug!("Reusing {} jobs of step {} ({})", handles.len(), step, short);
                handles
            }
            Resolution::Adopted(handles) => {
                on_replace();
                self.abort(jobs, session, step);
                match self.cache.copy(session, step.other(), step) {
                    Ok(copied) => debug!("Adopted cache of step {}: {}", step.other(), copied),
                    Err(e) => warn!("Cannot copy cache of step {}: {}", step.other(), e),
                }
                info!(
                    "Step {} of session {} shares the jobs of step {} ({})",
                    step,
                    session,
                    step.other(),
                    short
                );
                *jobs.slot(step) = Some(StepState {
                    fingerprint: fingerprint.clone(),
                    handles: handles.clone(),
                });
                handles
            }
            Resolution::Fresh => {
                on_replace();
                self.abort(jobs, session, step);
                match self.catalog.submit(fingerprint) {
                    Ok(handles) => {
                        info!(
                            "Submitted {} jobs for step {} of session {} ({})",
                            handles.len(),
                            step,
                            session,
                            short
                        );
                        *jobs.slot(step) = Some(StepState {
                            fingerprint: fingerprint.clone(),
                            handles: handles.clone(),
                        });
                        handles
                    }
                    Err(e) => {
                        warn!(
                            "Cannot submit step {} of session {} to {}: {}",
                            step, session, fingerprint.backend, e
                        );
                        Vec::new()
                    }
                }
            }
        }
    }

    /// Release the step's jobs in the background, clear its state and drop
    /// its cache. Handles the other step still uses are kept alive.
    pub fn abort(&self, jobs: &mut SessionJobs, session: &SessionId, step: Step) {
        let previous = jobs.slot(step).take();
        self.cache.invalidate(session, step);
        let Some(previous) = previous else {
            return;
        };
        let shared = jobs.handles(step.other());
        let releasable: Vec<JobHandle> = previous
            .handles
            .into_iter()
            .filter(|h| !shared.contains(h))
            .filter(|h| matches!(h, JobHandle::RemoteAsync { .. }))
            .collect();
        if releasable.is_empty() {
            return;
        }
        debug!(
            "Releasing {} jobs of step {} of session {}",
            releasable.len(),
            step,
            session
        );
        let catalog = Arc::clone(&self.catalog);
        let spawned = thread::Builder::new()
            .name("skyflow-abort".to_string())
            .spawn(move || release(&catalog, &releasable));
        if let Err(e) = spawned {
            warn!("Cannot start job release thread: {}", e);
        }
    }

    /// Abort both steps.
    pub fn abort_all(&self, jobs: &mut SessionJobs, session: &SessionId) {
        for step in Step::ALL {
            self.abort(jobs, session, step);
        }
    }
}

fn release(catalog: &CatalogClient, handles: &[JobHandle]) {
    for handle in handles {
        match catalog.cancel(handle) {
            Ok(()) => debug!("Released {}", handle.describe()),
            Err(e) => warn!("Cannot release {}: {}", handle.describe(), e),
        }
    }
}
