//! JSON job descriptions: the two queries of a session plus the pipeline
//! parameters.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use skyflow_engine::catalog::query::region_constraints;
use skyflow_engine::{Condition, SkyRegion};
use skyflow_protocol::{BackendId, PipelineParams, QueryFingerprint, SessionId, Step};

/// Query of one step, selected by sky region.
#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    pub backend: BackendId,
    pub catalogs: Vec<String>,
    #[serde(default)]
    pub fields: Vec<String>,
    pub region: SkyRegion,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Density map dataset used to check the region before submitting
    #[serde(default)]
    pub density: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobFile {
    /// Reuse a session (and its cached results); a fresh one otherwise
    #[serde(default)]
    pub session: Option<String>,
    pub science: StepSpec,
    pub control: StepSpec,
    pub params: PipelineParams,
}

impl JobFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid job file {}", path.display()))
    }

    pub fn session(&self) -> Result<SessionId> {
        match &self.session {
            Some(id) => SessionId::parse(id.as_str()).context("Invalid session id"),
            None => Ok(SessionId::new()),
        }
    }

    pub fn step(&self, step: Step) -> &StepSpec {
        match step {
            Step::Primary => &self.science,
            Step::Reference => &self.control,
        }
    }

    /// Canonical query of a step, with the region turned into backend
    /// constraints.
    pub fn fingerprint(&self, step: Step) -> Result<QueryFingerprint> {
        let spec = self.step(step);
        let constraints = region_constraints(
            spec.backend.kind(),
            &spec.region,
            &self.params.coords,
            &spec.conditions,
        )
        .with_context(|| format!("Cannot build the {} query", step.label()))?;
        Ok(QueryFingerprint::new(
            spec.backend.clone(),
            spec.catalogs.clone(),
            spec.fields.clone(),
            constraints,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skyflow_protocol::Constraints;

    const JOB: &str = r#"{
        "science": {
            "backend": {"kind": "remote_async", "url": "https://gea.esac.esa.int/tap-server/tap"},
            "catalogs": ["gaiadr3.gaia_source"],
            "density": "gaia_dr3",
            "fields": ["l", "b", "phot_g_mean_mag"],
            "region": {"frame": "galactic", "lon_min": 350.0, "lon_max": 10.0, "lat_min": -5.0, "lat_max": 5.0},
            "conditions": [{"column": "phot_g_mean_mag", "operator": "<", "value": "19"}]
        },
        "control": {
            "backend": {"kind": "remote_sync", "url": "https://vizier.cds.unistra.fr/viz-bin/votable"},
            "catalogs": ["I/355/gaiadr3"],
            "region": {"frame": "galactic", "lon_min": 20.0, "lon_max": 22.0, "lat_min": 10.0, "lat_max": 12.0}
        },
        "params": {
            "coords": {"galactic": {"lon": "l", "lat": "b"}},
            "map": {"frame": "galactic", "naxis1": 10, "naxis2": 10, "crpix1": 5.5, "crpix2": 5.5,
                    "crval1": 0.0, "crval2": 0.0, "scale": 60.0}
        }
    }"#;

    #[test]
    fn test_job_file_fingerprints() {
        let job: JobFile = serde_json::from_str(JOB).unwrap();

        let science = job.fingerprint(Step::Primary).unwrap();
        match &science.constraints {
            Constraints::Expression(expr) => {
                assert!(expr.starts_with("(l>=350 OR l<=10)"), "{}", expr);
                assert!(expr.ends_with("AND phot_g_mean_mag<19"), "{}", expr);
            }
            other => panic!("unexpected {:?}", other),
        }

        let control = job.fingerprint(Step::Reference).unwrap();
        match &control.constraints {
            Constraints::Columns(map) => {
                assert_eq!(map.get("l").map(String::as_str), Some(">=20 & <=22"));
                assert_eq!(map.get("b").map(String::as_str), Some(">=10 & <=12"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_ne!(science, control);
        assert_eq!(job.science.density.as_deref(), Some("gaia_dr3"));
        assert!(job.control.density.is_none());
    }

    #[test]
    fn test_session_id() {
        let mut job: JobFile = serde_json::from_str(JOB).unwrap();
        assert!(job.session().is_ok());
        job.session = Some("bad id/..".into());
        assert!(job.session().is_err());
    }
}
