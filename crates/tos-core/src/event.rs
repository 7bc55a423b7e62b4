use crate::taskspace::TaskspaceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single bus message. One of these per line, newline-terminated JSON,
/// `type` discriminated, `timestamp` in RFC 3339.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: BusEvent,
}

impl EventRecord {
    pub fn new(event: BusEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }

    /// Serialize to the single-line wire form (no trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    NewTaskspaceRequest {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_prompt: Option<String>,
    },
    UpdateTaskspace {
        uuid: TaskspaceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    StatusRequest,
    StatusResponse {
        taskspaces: Vec<TaskspaceStatusEntry>,
        #[serde(
            rename = "activeTaskSpace",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        active_task_space: Option<TaskspaceId>,
    },
    ProgressLog {
        message: String,
        category: ProgressCategory,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        taskspace_uuid: Option<TaskspaceId>,
    },
    UserSignal {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        taskspace_uuid: Option<TaskspaceId>,
    },
}

impl BusEvent {
    /// Wire name of the `type` field, for logging and dispatch accounting.
    pub fn type_name(&self) -> &'static str {
        match self {
            BusEvent::NewTaskspaceRequest { .. } => "new_taskspace_request",
            BusEvent::UpdateTaskspace { .. } => "update_taskspace",
            BusEvent::StatusRequest => "status_request",
            BusEvent::StatusResponse { .. } => "status_response",
            BusEvent::ProgressLog { .. } => "progress_log",
            BusEvent::UserSignal { .. } => "user_signal",
        }
    }
}

/// One roster row inside a `status_response`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskspaceStatusEntry {
    pub name: String,
    pub status: String,
    pub uuid: TaskspaceId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProgressCategory {
    Info,
    Warn,
    Error,
    Milestone,
    Question,
}

impl ProgressCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressCategory::Info => "info",
            ProgressCategory::Warn => "warn",
            ProgressCategory::Error => "error",
            ProgressCategory::Milestone => "milestone",
            ProgressCategory::Question => "question",
        }
    }
}

impl fmt::Display for ProgressCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressCategory {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "info" => Ok(ProgressCategory::Info),
            "warn" | "warning" => Ok(ProgressCategory::Warn),
            "error" => Ok(ProgressCategory::Error),
            "milestone" => Ok(ProgressCategory::Milestone),
            "question" => Ok(ProgressCategory::Question),
            other => Err(format!("unknown category: {other}")),
        }
    }
}
