//! Domain models, produced from the wire schema by [`crate::wire`].

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;

use crate::error::ParseError;
use crate::stage::StageStatus;

/// Pipeline run identifier. The backend sends numbers or strings; both end up here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for RunId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Run-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Terminal runs are never polled.
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Pending and Running runs are polled.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseError;

    /// Case-insensitive. `PermanentlyFailed` at run level folds into `Failed`,
    /// `Canceled` into `Cancelled`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "pending" | "queued" => Ok(Self::Pending),
            "running" | "retrying" => Ok(Self::Running),
            "completed" | "succeeded" => Ok(Self::Completed),
            "failed" | "permanentlyfailed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(ParseError::new("run.status", format!("unknown status {s:?}"))),
        }
    }
}

/// Stage output, degraded to raw text when the backend sends malformed JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StageOutput {
    Json(Value),
    Raw { text: String, error: String },
}

impl StageOutput {
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::Raw { .. })
    }
}

/// One unit of work within a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    pub stage_type: String,
    pub status: StageStatus,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub output: Option<StageOutput>,
}

/// Full run detail, as shown in a run view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub stages: Vec<Stage>,
}

impl Run {
    pub fn stage(&self, stage_type: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.stage_type == stage_type)
    }

    pub fn stage_mut(&mut self, stage_type: &str) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.stage_type == stage_type)
    }
}

/// Row of the run list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub id: RunId,
    pub status: Option<RunStatus>,
    pub concept_id: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// A single log line of a run's buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub run_id: RunId,
    pub text: String,
    /// Position in the buffer; seeded lines come first.
    pub arrival_order: u64,
}

/// Body of `POST /pipeline-runs`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    pub concept_id: String,
    pub auto_start: bool,
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    let ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);
    ms
}
