//! Structured replies of the control plane.
//!
//! Every control call answers with a [`ControlMessage`]; process controls also
//! return the log snapshot taken while handling the call.

use serde::{Deserialize, Serialize};

use crate::types::{JobHandle, ProcessLogEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlStatus {
    Success,
    Error,
}

/// Human-readable outcome of a control call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub status: ControlStatus,
    pub header: String,
    pub content: String,
}

impl ControlMessage {
    pub fn success(header: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            status: ControlStatus::Success,
            header: header.into(),
            content: content.into(),
        }
    }

    pub fn error(header: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            status: ControlStatus::Error,
            header: header.into(),
            content: content.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ControlStatus::Success
    }
}

/// Reply of start/stop/abort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    pub message: ControlMessage,
    pub logs: Vec<ProcessLogEntry>,
}

/// Reply of monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorReply {
    pub success: bool,
    pub log: Vec<ProcessLogEntry>,
}

/// Reply of an area check: the verdict, the estimated object count and the
/// jobs submitted for the area, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaReply {
    pub message: ControlMessage,
    pub estimate: f64,
    pub handles: Vec<JobHandle>,
}

impl MonitorReply {
    pub fn last(&self) -> Option<&ProcessLogEntry> {
        self.log.last()
    }
}
