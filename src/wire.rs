//! Wire schema and the normalization adapter.
//!
//! The backend is inconsistent about key casing (`stageType` vs `StageType`)
//! and id types (`12` vs `"12"`). Every collaborator payload is decoded here,
//! once, into the typed models of [`crate::model`] and the hub events of
//! [`crate::dispatcher`]. Nothing downstream looks at raw JSON keys.
//!
//! Decoding is lenient per field: an unknown status or a malformed output
//! payload degrades that one field and is reported alongside the value,
//! never failing the whole document.

use serde::Deserialize;
use serde_json::Value;

use crate::dispatcher::{HubEvent, JobCompleted, JobProgress, LogEvent};
use crate::error::ParseError;
use crate::model::{LogLine, Run, RunId, RunStatus, RunSummary, Stage, StageOutput};
use crate::stage::StageStatus;

/// Hub method names.
pub const EVENT_JOB_PROGRESS: &str = "JobProgress";
pub const EVENT_JOB_COMPLETED: &str = "JobCompleted";
pub const EVENT_RECEIVE_LOG: &str = "ReceiveLog";
pub const INVOKE_JOIN_RUN_GROUP: &str = "JoinRunGroup";
pub const INVOKE_LEAVE_RUN_GROUP: &str = "LeaveRunGroup";

/// Ids arrive as JSON numbers or strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Num(i64),
    Text(String),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            WireId::Num(n) => n.to_string(),
            WireId::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunDto {
    #[serde(alias = "Id")]
    id: WireId,
    #[serde(alias = "Status", default)]
    status: Option<String>,
    #[serde(alias = "StartedAt", default)]
    started_at: Option<String>,
    #[serde(alias = "CompletedAt", default)]
    completed_at: Option<String>,
    #[serde(alias = "ErrorMessage", default)]
    error_message: Option<String>,
    #[serde(alias = "ConceptId", default)]
    concept_id: Option<WireId>,
    #[serde(alias = "Stages", default)]
    stages: Vec<StageDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StageDto {
    #[serde(alias = "StageType", alias = "type", alias = "Type")]
    stage_type: String,
    #[serde(alias = "Status", default)]
    status: Option<String>,
    #[serde(alias = "StartedAt", default)]
    started_at: Option<String>,
    #[serde(alias = "FinishedAt", default)]
    finished_at: Option<String>,
    #[serde(alias = "DurationMs", default)]
    duration_ms: Option<Value>,
    #[serde(alias = "Error", default)]
    error: Option<String>,
    #[serde(alias = "OutputPayload", default)]
    output_payload: Option<Value>,
}

/// A stage as reported by the backend, before reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedStage {
    pub stage_type: String,
    pub status: Result<StageStatus, ParseError>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub output: Option<StageOutput>,
}

impl ReportedStage {
    /// Build a [`Stage`] with the given (already reconciled) status.
    pub fn with_status(&self, status: StageStatus) -> Stage {
        Stage {
            stage_type: self.stage_type.clone(),
            status,
            started_at: self.started_at.clone(),
            finished_at: self.finished_at.clone(),
            duration_ms: self.duration_ms,
            error: self.error.clone(),
            output: self.output.clone(),
        }
    }
}

/// A run as reported by the backend, before reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedRun {
    pub id: RunId,
    pub status: Result<RunStatus, ParseError>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub stages: Vec<ReportedStage>,
}

impl ReportedRun {
    /// Every field-level decode problem in this report.
    pub fn issues(&self) -> Vec<ParseError> {
        let mut issues = Vec::new();
        if let Err(e) = &self.status {
            issues.push(e.clone());
        }
        for stage in &self.stages {
            if let Err(e) = &stage.status {
                issues.push(ParseError::new(
                    format!("stages[{}].status", stage.stage_type),
                    e.message.clone(),
                ));
            }
            if let Some(StageOutput::Raw { error, .. }) = &stage.output {
                issues.push(ParseError::new(
                    format!("stages[{}].outputPayload", stage.stage_type),
                    error.clone(),
                ));
            }
        }
        issues
    }

    /// Take the report at face value, without a previous snapshot to
    /// reconcile against. Unknown statuses fall back to `Pending`.
    pub fn into_run(self) -> Run {
        Run {
            id: self.id,
            status: self.status.unwrap_or(RunStatus::Pending),
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
            stages: self
                .stages
                .iter()
                .map(|s| s.with_status(s.status.clone().unwrap_or(StageStatus::Pending)))
                .collect(),
        }
    }
}

/// Decode `GET /pipeline-runs/{id}` (and the create response).
pub fn decode_run(body: &Value) -> Result<ReportedRun, ParseError> {
    let dto = RunDto::deserialize(body).map_err(|e| ParseError::new("run", e.to_string()))?;
    Ok(normalize_run(dto))
}

fn normalize_run(dto: RunDto) -> ReportedRun {
    let status = match dto.status {
        Some(s) => s.parse::<RunStatus>(),
        None => Err(ParseError::new("run.status", "missing")),
    };
    ReportedRun {
        id: RunId::new(dto.id.into_string()),
        status,
        started_at: dto.started_at,
        completed_at: dto.completed_at,
        error_message: dto.error_message,
        stages: dto.stages.into_iter().map(normalize_stage).collect(),
    }
}

fn normalize_stage(dto: StageDto) -> ReportedStage {
    let status = match dto.status {
        Some(s) => s.parse::<StageStatus>(),
        None => Err(ParseError::new("stage.status", "missing")),
    };
    ReportedStage {
        stage_type: dto.stage_type,
        status,
        started_at: dto.started_at,
        finished_at: dto.finished_at,
        duration_ms: dto.duration_ms.as_ref().map_or(0, duration_from_value),
        error: dto.error,
        output: dto.output_payload.and_then(decode_output),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn duration_from_value(v: &Value) -> u64 {
    v.as_u64()
        .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
        .unwrap_or(0)
}

/// Stage output is either embedded JSON or a JSON document serialized into a
/// string. A string that fails to parse is kept verbatim with the error.
pub fn decode_output(value: Value) -> Option<StageOutput> {
    match value {
        Value::Null => None,
        Value::String(text) if text.trim().is_empty() => None,
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed) => Some(StageOutput::Json(parsed)),
            Err(e) => Some(StageOutput::Raw {
                text,
                error: e.to_string(),
            }),
        },
        other => Some(StageOutput::Json(other)),
    }
}

/// Decode `GET /pipeline-runs`, either a bare array or `{ items: [...] }`.
pub fn decode_run_list(body: &Value) -> Result<Vec<RunSummary>, ParseError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListDto {
        Bare(Vec<RunDto>),
        Wrapped {
            #[serde(alias = "Items", alias = "runs", alias = "Runs")]
            items: Vec<RunDto>,
        },
    }

    let list = ListDto::deserialize(body).map_err(|e| ParseError::new("runs", e.to_string()))?;
    let dtos = match list {
        ListDto::Bare(v) | ListDto::Wrapped { items: v } => v,
    };
    Ok(dtos
        .into_iter()
        .map(|dto| RunSummary {
            id: RunId::new(dto.id.into_string()),
            status: dto.status.and_then(|s| s.parse().ok()),
            concept_id: dto.concept_id.map(WireId::into_string),
            started_at: dto.started_at,
            completed_at: dto.completed_at,
        })
        .collect())
}

/// Decode `GET /pipeline-runs/{id}/logs` into lines numbered from zero.
///
/// Accepts a bare array or `{ logs: [...] }`, where each entry is a string or
/// an object with a `message` field.
pub fn decode_log_history(run_id: &RunId, body: &Value) -> Result<Vec<LogLine>, ParseError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum EntryDto {
        Text(String),
        Entry {
            #[serde(alias = "Message", alias = "text", alias = "Text", alias = "line")]
            message: String,
        },
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HistoryDto {
        Bare(Vec<EntryDto>),
        Wrapped {
            #[serde(alias = "Logs", alias = "items", alias = "Items")]
            logs: Vec<EntryDto>,
        },
    }

    if body.is_null() {
        return Ok(Vec::new());
    }
    let history =
        HistoryDto::deserialize(body).map_err(|e| ParseError::new("logs", e.to_string()))?;
    let entries = match history {
        HistoryDto::Bare(v) | HistoryDto::Wrapped { logs: v } => v,
    };
    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(i, e)| LogLine {
            run_id: run_id.clone(),
            text: match e {
                EntryDto::Text(t) | EntryDto::Entry { message: t } => t,
            },
            arrival_order: i as u64,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobProgressDto {
    #[serde(alias = "JobId")]
    job_id: WireId,
    #[serde(alias = "Progress", default)]
    progress: Option<f64>,
    #[serde(alias = "Status", default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobCompletedDto {
    #[serde(alias = "JobId")]
    job_id: WireId,
    #[serde(alias = "Success", default)]
    success: bool,
    #[serde(alias = "Message", default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LogDto {
    Text(String),
    Entry {
        #[serde(alias = "Message", alias = "text", alias = "Text")]
        message: String,
        #[serde(rename = "runId", alias = "RunId", alias = "runID", default)]
        run_id: Option<WireId>,
    },
}

/// Decode one hub invocation into a typed event.
///
/// Returns `Ok(None)` for targets this client does not consume.
pub fn decode_event(target: &str, arguments: &[Value]) -> Result<Option<HubEvent>, ParseError> {
    let first = || {
        arguments
            .first()
            .ok_or_else(|| ParseError::new(target, "missing argument"))
    };
    let event = match target {
        EVENT_JOB_PROGRESS => {
            let dto = JobProgressDto::deserialize(first()?)
                .map_err(|e| ParseError::new(target, e.to_string()))?;
            HubEvent::JobProgress(JobProgress {
                job_id: dto.job_id.into_string(),
                progress: dto.progress.map(clamp_progress),
                status: dto.status.filter(|s| !s.is_empty()),
            })
        }
        EVENT_JOB_COMPLETED => {
            let dto = JobCompletedDto::deserialize(first()?)
                .map_err(|e| ParseError::new(target, e.to_string()))?;
            HubEvent::JobCompleted(JobCompleted {
                job_id: dto.job_id.into_string(),
                success: dto.success,
                message: dto.message.filter(|s| !s.is_empty()),
            })
        }
        EVENT_RECEIVE_LOG => {
            let dto =
                LogDto::deserialize(first()?).map_err(|e| ParseError::new(target, e.to_string()))?;
            let (message, run_id) = match dto {
                LogDto::Text(message) => (message, None),
                LogDto::Entry { message, run_id } => {
                    (message, run_id.map(|id| RunId::new(id.into_string())))
                }
            };
            HubEvent::ReceiveLog(LogEvent { run_id, message })
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_progress(p: f64) -> u8 {
    if p.is_nan() {
        0
    } else {
        p.round().clamp(0.0, 100.0) as u8
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn run_decodes_camel_and_pascal_case() {
        let camel = json!({
            "id": 12,
            "status": "Failed",
            "startedAt": "2026-01-01T10:00:00Z",
            "stages": [{ "stageType": "Render", "status": "Failed", "durationMs": 1500 }]
        });
        let pascal = json!({
            "Id": "12",
            "Status": "Failed",
            "StartedAt": "2026-01-01T10:00:00Z",
            "Stages": [{ "StageType": "Render", "Status": "Failed", "DurationMs": 1500 }]
        });
        let a = decode_run(&camel).unwrap();
        let b = decode_run(&pascal).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id.as_str(), "12");
        assert_eq!(a.status, Ok(RunStatus::Failed));
        assert_eq!(a.stages[0].status, Ok(StageStatus::Failed));
        assert_eq!(a.stages[0].duration_ms, 1500);
    }

    #[test]
    fn unknown_stage_status_is_reported_not_fatal() {
        let report = decode_run(&json!({
            "id": 1,
            "status": "Running",
            "stages": [
                { "type": "Script", "status": "Completed" },
                { "type": "Render", "status": "Melting" }
            ]
        }))
        .unwrap();
        assert!(report.stages[1].status.is_err());
        assert_eq!(report.issues().len(), 1);
        let run = report.into_run();
        assert_eq!(run.stages[1].status, StageStatus::Pending);
        assert_eq!(run.stages[0].status, StageStatus::Completed);
    }

    #[test]
    fn stage_order_is_preserved() {
        let report = decode_run(&json!({
            "id": 3,
            "status": "Running",
            "stages": [
                { "stageType": "Topic", "status": "Completed" },
                { "stageType": "Script", "status": "Completed" },
                { "stageType": "Render", "status": "Running" },
                { "stageType": "Publish", "status": "Pending" }
            ]
        }))
        .unwrap();
        let order: Vec<_> = report.stages.iter().map(|s| s.stage_type.as_str()).collect();
        assert_eq!(order, ["Topic", "Script", "Render", "Publish"]);
    }

    #[test]
    fn stringified_output_payload_is_parsed() {
        let out = decode_output(json!("{\"videoUrl\":\"v.mp4\"}")).unwrap();
        assert_eq!(out, StageOutput::Json(json!({ "videoUrl": "v.mp4" })));
    }

    #[test]
    fn malformed_output_payload_degrades_to_raw() {
        let out = decode_output(json!("{not json")).unwrap();
        match out {
            StageOutput::Raw { text, error } => {
                assert_eq!(text, "{not json");
                assert!(!error.is_empty());
            }
            StageOutput::Json(_) => panic!("expected raw output"),
        }
    }

    #[test]
    fn embedded_output_object_passes_through() {
        let out = decode_output(json!({ "script": "hello" })).unwrap();
        assert_eq!(out, StageOutput::Json(json!({ "script": "hello" })));
        assert!(decode_output(Value::Null).is_none());
    }

    #[test]
    fn run_list_accepts_bare_and_wrapped() {
        let bare = decode_run_list(&json!([{ "id": 1, "status": "Running", "conceptId": 9 }]))
            .unwrap();
        let wrapped = decode_run_list(&json!({ "items": [{ "Id": 1, "Status": "Running" }] }))
            .unwrap();
        assert_eq!(bare[0].id, wrapped[0].id);
        assert_eq!(bare[0].concept_id.as_deref(), Some("9"));
        assert_eq!(wrapped[0].status, Some(RunStatus::Running));
    }

    #[test]
    fn log_history_mixed_entries() {
        let run = RunId::from("5");
        let lines =
            decode_log_history(&run, &json!(["first", { "message": "second" }, { "Message": "third" }]))
                .unwrap();
        let texts: Vec<_> = lines.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, ["first", "second", "third"]);
        assert_eq!(lines[2].arrival_order, 2);
        assert!(decode_log_history(&run, &Value::Null).unwrap().is_empty());
    }

    #[test]
    fn job_progress_event_decodes() {
        let event = decode_event(
            "JobProgress",
            &[json!({ "jobId": "7", "progress": 40, "status": "Rendering" })],
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            event,
            HubEvent::JobProgress(JobProgress {
                job_id: "7".into(),
                progress: Some(40),
                status: Some("Rendering".into()),
            })
        );
    }

    #[test]
    fn job_progress_is_clamped() {
        let Some(HubEvent::JobProgress(p)) =
            decode_event("JobProgress", &[json!({ "JobId": 7, "Progress": 140.2 })]).unwrap()
        else {
            panic!("expected job progress");
        };
        assert_eq!(p.progress, Some(100));
        assert_eq!(p.job_id, "7");
        assert_eq!(p.status, None);
    }

    #[test]
    fn receive_log_accepts_plain_string_and_scoped_object() {
        let plain = decode_event("ReceiveLog", &[json!("rendering frame 10")]).unwrap();
        assert_eq!(
            plain,
            Some(HubEvent::ReceiveLog(LogEvent {
                run_id: None,
                message: "rendering frame 10".into()
            }))
        );
        let scoped =
            decode_event("ReceiveLog", &[json!({ "runId": 42, "message": "hi" })]).unwrap();
        assert_eq!(
            scoped,
            Some(HubEvent::ReceiveLog(LogEvent {
                run_id: Some(RunId::from("42")),
                message: "hi".into()
            }))
        );
    }

    #[test]
    fn unknown_target_is_ignored_and_bad_payload_is_an_error() {
        assert_eq!(decode_event("SomethingElse", &[json!(1)]).unwrap(), None);
        assert!(decode_event("JobCompleted", &[]).is_err());
        assert!(decode_event("JobCompleted", &[json!({ "success": true })]).is_err());
    }
}
