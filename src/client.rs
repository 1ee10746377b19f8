//! HTTP client for the pipeline-run REST endpoints.
//!
//! [`RunsApi`] is what the run view and the CLI talk to; [`PipelineClient`]
//! implements it over `reqwest`. Responses go through [`crate::wire`] so the
//! rest of the crate only sees domain types.
//!
//! ## Authentication
//!
//! Every request carries `Authorization: Bearer <token>`, fetched from the
//! [`TokenProvider`] right before the request is sent.
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for an `error` or `message` field in the JSON
//! body. If that fails, the raw response body is used as the error message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::auth::TokenProvider;
use crate::error::ClientError;
use crate::model::{CreateRunRequest, LogLine, RunId, RunSummary};
use crate::wire::{self, ReportedRun};

/// The pipeline-run endpoints.
#[async_trait]
pub trait RunsApi: Send + Sync {
    /// `GET /pipeline-runs?conceptId=`
    async fn list_runs(&self, concept_id: Option<&str>) -> Result<Vec<RunSummary>, ClientError>;

    /// `GET /pipeline-runs/{id}`
    async fn get_run(&self, run_id: &RunId) -> Result<ReportedRun, ClientError>;

    /// `GET /pipeline-runs/{id}/logs`
    async fn get_run_logs(&self, run_id: &RunId) -> Result<Vec<LogLine>, ClientError>;

    /// `POST /pipeline-runs`
    async fn create_run(&self, request: &CreateRunRequest) -> Result<ReportedRun, ClientError>;

    /// `POST /pipeline-runs/{id}/start`
    async fn start_run(&self, run_id: &RunId) -> Result<(), ClientError>;

    /// `POST /pipeline-runs/{id}/retry-stage`
    async fn retry_stage(&self, run_id: &RunId, stage_type: &str) -> Result<(), ClientError>;
}

/// REST client for one backend.
pub struct PipelineClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
    timeout: Duration,
}

impl PipelineClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, ClientError> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        default_headers.insert(
            reqwest::header::HeaderName::from_static("x-pipewatch-client"),
            reqwest::header::HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        );
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn token(&self) -> Result<String, ClientError> {
        self.tokens.token().ok_or(ClientError::MissingToken)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ClientError> {
        let resp = request
            .bearer_auth(self.token()?)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        self.handle_response(resp).await
    }

    fn request_error(&self, e: reqwest::Error) -> ClientError {
        if e.is_timeout() {
            #[allow(clippy::cast_possible_truncation)]
            let ms = self.timeout.as_millis() as u64;
            ClientError::Timeout(ms)
        } else {
            ClientError::Request(e)
        }
    }

    /// Parse an HTTP response: the JSON body on success (`Null` when empty),
    /// or a [`ClientError`] with the backend's message on failure.
    async fn handle_response(&self, resp: reqwest::Response) -> Result<Value, ClientError> {
        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.request_error(e))?;

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&body)
                .map_err(|e| ClientError::Protocol(format!("invalid JSON from backend: {e}")))
        } else {
            let message = error_message(&body).unwrap_or(body);
            Err(ClientError::Backend {
                status: status.as_u16(),
                message,
            })
        }
    }
}

fn error_message(body: &str) -> Option<String> {
    let v = serde_json::from_str::<Value>(body).ok()?;
    ["error", "message", "Error", "Message", "title"]
        .iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .map(String::from)
}

fn protocol(e: crate::error::ParseError) -> ClientError {
    ClientError::Protocol(e.to_string())
}

#[async_trait]
impl RunsApi for PipelineClient {
    async fn list_runs(&self, concept_id: Option<&str>) -> Result<Vec<RunSummary>, ClientError> {
        let mut req = self.http.get(self.url("/pipeline-runs"));
        if let Some(id) = concept_id {
            req = req.query(&[("conceptId", id)]);
        }
        let body = self.send(req).await?;
        wire::decode_run_list(&body).map_err(protocol)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<ReportedRun, ClientError> {
        let body = self
            .send(self.http.get(self.url(&format!("/pipeline-runs/{run_id}"))))
            .await?;
        wire::decode_run(&body).map_err(protocol)
    }

    async fn get_run_logs(&self, run_id: &RunId) -> Result<Vec<LogLine>, ClientError> {
        let body = self
            .send(self.http.get(self.url(&format!("/pipeline-runs/{run_id}/logs"))))
            .await?;
        wire::decode_log_history(run_id, &body).map_err(protocol)
    }

    async fn create_run(&self, request: &CreateRunRequest) -> Result<ReportedRun, ClientError> {
        let body = self
            .send(self.http.post(self.url("/pipeline-runs")).json(request))
            .await?;
        wire::decode_run(&body).map_err(protocol)
    }

    async fn start_run(&self, run_id: &RunId) -> Result<(), ClientError> {
        self.send(
            self.http
                .post(self.url(&format!("/pipeline-runs/{run_id}/start"))),
        )
        .await?;
        Ok(())
    }

    async fn retry_stage(&self, run_id: &RunId, stage_type: &str) -> Result<(), ClientError> {
        self.send(
            self.http
                .post(self.url(&format!("/pipeline-runs/{run_id}/retry-stage")))
                .json(&json!({ "stageType": stage_type })),
        )
        .await?;
        Ok(())
    }
}
