//! UWS/TAP job service over HTTP.
//!
//! Job lifecycle: `POST {service}/async` creates the job (the redirect target
//! is the job locator), `POST {job}/phase PHASE=RUN` starts it,
//! `GET {job}/phase` reports progress, `GET {job}/results/result` streams the
//! VOTable and `DELETE {job}` releases it.

use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::blocking::{Client, Response};
use tracing::{debug, info};

use super::{AsyncJobService, JobPhase, ResultStream, SubmittedJob};
use crate::error::CatalogError;

/// Extra allowance on top of the server-side WAIT
const REQUEST_SLACK: Duration = Duration::from_secs(30);

/// Timeout of short control requests
const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval bounds when the server ignores WAIT
const MIN_POLL: Duration = Duration::from_secs(1);
const MAX_POLL: Duration = Duration::from_secs(30);

pub struct TapService {
    client: Client,
    base: String,
    phase_wait: Duration,
    transfer_timeout: Duration,
}

fn transport(err: reqwest::Error) -> CatalogError {
    CatalogError::Transport(err.to_string())
}

fn check(response: Response) -> Result<Response, CatalogError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status.is_server_error() {
        Err(CatalogError::Transport(format!(
            "HTTP {} from {}",
            status,
            response.url()
        )))
    } else {
        Err(CatalogError::Rejected(format!(
            "HTTP {} from {}",
            status,
            response.url()
        )))
    }
}

/// Parse a UWS destruction time; servers differ on the zone suffix.
pub(crate) fn parse_destruction(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|t| t.and_utc())
        })
}

/// Job id from a UWS job document, for servers answering without a redirect.
fn job_id(document: &str) -> Option<&str> {
    let start = document.find("jobId>")? + "jobId>".len();
    let end = document[start..].find('<')? + start;
    Some(document[start..end].trim()).filter(|id| !id.is_empty())
}

impl TapService {
    pub fn new(client: Client, base: &str, phase_wait: Duration, transfer_timeout: Duration) -> Self {
        Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            phase_wait,
            transfer_timeout,
        }
    }

    fn query_params<'a>(&self, query: &'a str, max_records: &'a str) -> [(&'static str, &'a str); 5] {
        [
            ("REQUEST", "doQuery"),
            ("LANG", "ADQL"),
            ("FORMAT", "votable"),
            ("MAXREC", max_records),
            ("QUERY", query),
        ]
    }

    fn phase_once(&self, locator: &str, wait: Duration) -> Result<JobPhase, CatalogError> {
        let wait_secs = wait.as_secs().to_string();
        let response = self
            .client
            .get(format!("{}/phase", locator))
            .query(&[("WAIT", wait_secs.as_str())])
            .timeout(wait + REQUEST_SLACK)
            .send()
            .map_err(transport)?;
        let text = check(response)?.text().map_err(transport)?;
        Ok(JobPhase::classify(&text))
    }
}

impl AsyncJobService for TapService {
    fn submit(&self, query: &str, max_records: u64) -> Result<SubmittedJob, CatalogError> {
        let endpoint = format!("{}/async", self.base);
        let max_records = max_records.to_string();
        let response = self
            .client
            .post(&endpoint)
            .form(&self.query_params(query, &max_records))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .map_err(transport)?;
        let response = check(response)?;
        let final_url = response.url().as_str().trim_end_matches('/').to_string();
        let locator = if final_url != endpoint {
            final_url
        } else {
            let document = response.text().map_err(transport)?;
            let id = job_id(&document).ok_or_else(|| {
                CatalogError::Rejected("job creation returned no job id".to_string())
            })?;
            format!("{}/{}", endpoint, id)
        };

        let run = self
            .client
            .post(format!("{}/phase", locator))
            .form(&[("PHASE", "RUN")])
            .timeout(CONTROL_TIMEOUT)
            .send()
            .map_err(transport)?;
        check(run)?;

        // Services are not required to publish a destruction time
        let destruction = self
            .client
            .get(format!("{}/destruction", locator))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .ok()
            .filter(|r| r.status().is_success())
            .and_then(|r| r.text().ok())
            .and_then(|t| parse_destruction(&t));

        info!("Created job {}", locator);
        Ok(SubmittedJob {
            locator,
            destruction,
        })
    }

    fn wait_phase(&self, locator: &str, timeout: Duration) -> Result<JobPhase, CatalogError> {
        let started = Instant::now();
        let mut pause = MIN_POLL;
        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            let phase = self.phase_once(locator, remaining.min(self.phase_wait))?;
            match &phase {
                JobPhase::Pending(name) if started.elapsed() + pause < timeout => {
                    debug!("Job {} in phase {}", locator, name);
                    std::thread::sleep(pause);
                    pause = (pause * 2).min(MAX_POLL);
                }
                _ => return Ok(phase),
            }
        }
    }

    fn open_result(&self, locator: &str) -> Result<ResultStream, CatalogError> {
        let response = self
            .client
            .get(format!("{}/results/result", locator))
            .timeout(self.transfer_timeout)
            .send()
            .map_err(transport)?;
        Ok(Box::new(check(response)?))
    }

    fn delete(&self, locator: &str) -> Result<(), CatalogError> {
        let response = self
            .client
            .delete(locator)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .map_err(transport)?;
        check(response)?;
        debug!("Deleted job {}", locator);
        Ok(())
    }

    fn search(&self, query: &str, max_records: u64) -> Result<ResultStream, CatalogError> {
        let max_records = max_records.to_string();
        let response = self
            .client
            .get(format!("{}/sync", self.base))
            .query(&self.query_params(query, &max_records))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .map_err(transport)?;
        Ok(Box::new(check(response)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_destruction_formats() {
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_destruction("2026-03-01T12:00:00Z"), Some(expected));
        assert_eq!(parse_destruction("2026-03-01T12:00:00+00:00\n"), Some(expected));
        assert_eq!(parse_destruction("2026-03-01T12:00:00.000"), Some(expected));
        assert_eq!(parse_destruction(""), None);
        assert_eq!(parse_destruction("never"), None);
    }

    #[test]
    fn test_job_id_from_document() {
        let doc = "<uws:job><uws:jobId>1700000000123O</uws:jobId><uws:phase>PENDING</uws:phase></uws:job>";
        assert_eq!(job_id(doc), Some("1700000000123O"));
        assert_eq!(job_id("<uws:job/>"), None);
    }

    #[test]
    fn test_base_url_is_normalized() {
        let service = TapService::new(
            Client::new(),
            "https://tap.example.org/tap/",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert_eq!(service.base, "https://tap.example.org/tap");
    }
}
