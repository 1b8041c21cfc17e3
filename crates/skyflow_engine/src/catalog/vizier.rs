//! VizieR-style catalog form service.
//!
//! One POST per request: `-source` names the catalog, `-out` the columns,
//! `-out.max` the row limit, and every other form field is a column
//! constraint in the service's own syntax (`>=10 & <=20`).

use std::time::Duration;

use reqwest::blocking::Client;
use skyflow_protocol::SyncPayload;
use tracing::debug;

use super::{ResultStream, SyncQueryService};
use crate::error::CatalogError;

pub struct VizierService {
    client: Client,
    timeout: Duration,
}

impl VizierService {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

/// Form fields of one request.
pub(crate) fn form_fields(payload: &SyncPayload) -> Vec<(String, String)> {
    let mut form = vec![
        ("-source".to_string(), payload.source.clone()),
        ("-out.max".to_string(), payload.row_limit.to_string()),
        ("-out.form".to_string(), "VOTable".to_string()),
    ];
    if !payload.columns.is_empty() {
        form.push(("-out".to_string(), payload.columns.join(",")));
    }
    form.extend(
        payload
            .constraints
            .iter()
            .map(|(column, condition)| (column.clone(), condition.clone())),
    );
    form
}

impl SyncQueryService for VizierService {
    fn request(&self, payload: &SyncPayload) -> Result<ResultStream, CatalogError> {
        debug!("Querying {} at {}", payload.source, payload.url);
        let response = self
            .client
            .post(&payload.url)
            .form(&form_fields(payload))
            .timeout(self.timeout)
            .send()
            .map_err(|e| CatalogError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(CatalogError::Transport(format!("HTTP {} from {}", status, payload.url)));
        }
        if !status.is_success() {
            return Err(CatalogError::Rejected(format!("HTTP {} from {}", status, payload.url)));
        }
        Ok(Box::new(response))
    }
}
