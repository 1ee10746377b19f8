//! In-memory collaborators for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};

use crate::client::RunsApi;
use crate::error::{ClientError, HubError};
use crate::model::{CreateRunRequest, LogLine, RunId, RunSummary};
use crate::protocol::HubMessage;
use crate::transport::{Channel, Transport};
use crate::wire::{self, ReportedRun};

#[derive(Default)]
struct MockTransportState {
    opened: usize,
    tokens: Vec<String>,
    failures: VecDeque<HubError>,
}

/// Transport whose server side is driven by the test through [`ServerEnd`].
pub(crate) struct MockTransport {
    state: Mutex<MockTransportState>,
    accept_tx: mpsc::UnboundedSender<ServerEnd>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ServerEnd>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(MockTransportState::default()),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            gate: Mutex::new(None),
        }
    }

    /// Block `open` until [`MockTransport::release_opens`].
    pub fn hold_opens(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_opens(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.close();
        }
    }

    /// Make the next `open` fail with `error`. Calls queue up.
    pub fn fail_next(&self, error: HubError) {
        self.state.lock().failures.push_back(error);
    }

    /// Number of `open` calls, failed ones included.
    pub fn open_count(&self) -> usize {
        self.state.lock().opened
    }

    pub fn tokens_seen(&self) -> Vec<String> {
        self.state.lock().tokens.clone()
    }

    /// Wait for the client to open the next connection.
    pub async fn accept(&self) -> ServerEnd {
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .expect("mock transport sender dropped")
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, token: &str) -> Result<Channel, HubError> {
        {
            let mut state = self.state.lock();
            state.opened += 1;
            state.tokens.push(token.to_string());
            if let Some(err) = state.failures.pop_front() {
                return Err(err);
            }
        }
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }

        let (to_client, client_rx) = mpsc::unbounded_channel::<Result<HubMessage, HubError>>();
        let (client_tx, from_client) = mpsc::unbounded_channel::<HubMessage>();
        let _ = self.accept_tx.send(ServerEnd {
            to_client,
            from_client,
        });

        let stream = futures_util::stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let sink = futures_util::sink::unfold(
            client_tx,
            |tx: mpsc::UnboundedSender<HubMessage>, msg: HubMessage| async move {
                tx.send(msg).map_err(|_| HubError::Closed)?;
                Ok::<_, HubError>(tx)
            },
        );
        Ok(Channel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Server side of one mock connection. Dropping it drops the connection.
pub(crate) struct ServerEnd {
    to_client: mpsc::UnboundedSender<Result<HubMessage, HubError>>,
    from_client: mpsc::UnboundedReceiver<HubMessage>,
}

impl ServerEnd {
    pub fn send(&self, msg: HubMessage) {
        let _ = self.to_client.send(Ok(msg));
    }

    /// Next non-ping message from the client.
    pub async fn recv_invocation(&mut self) -> Option<HubMessage> {
        loop {
            match self.from_client.recv().await? {
                HubMessage::Ping => continue,
                msg => return Some(msg),
            }
        }
    }

    pub fn drop_connection(self) {}
}

#[derive(Default)]
struct FakeApiState {
    run: Option<Value>,
    queued: VecDeque<Result<Value, (u16, String)>>,
    logs: Vec<String>,
    retry_failure: Option<(u16, String)>,
    get_run_calls: usize,
    retry_calls: Vec<(RunId, String)>,
    created: usize,
}

/// Scriptable [`RunsApi`]. `get_run` serves queued responses first, then the
/// current run document.
#[derive(Default)]
pub(crate) struct FakeApi {
    state: Mutex<FakeApiState>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_run(&self, run: Value) {
        self.state.lock().run = Some(run);
    }

    pub fn push_run(&self, run: Value) {
        self.state.lock().queued.push_back(Ok(run));
    }

    pub fn fail_next_get(&self, status: u16, message: &str) {
        self.state
            .lock()
            .queued
            .push_back(Err((status, message.to_string())));
    }

    pub fn set_logs(&self, lines: &[&str]) {
        self.state.lock().logs = lines.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_retry(&self, status: u16, message: &str) {
        self.state.lock().retry_failure = Some((status, message.to_string()));
    }

    pub fn get_run_calls(&self) -> usize {
        self.state.lock().get_run_calls
    }

    pub fn retry_calls(&self) -> Vec<(RunId, String)> {
        self.state.lock().retry_calls.clone()
    }

    /// Block `get_run` until [`FakeApi::release`].
    pub fn hold(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.close();
        }
    }
}

fn backend((status, message): (u16, String)) -> ClientError {
    ClientError::Backend { status, message }
}

#[async_trait]
impl RunsApi for FakeApi {
    async fn list_runs(&self, _concept_id: Option<&str>) -> Result<Vec<RunSummary>, ClientError> {
        Ok(Vec::new())
    }

    async fn get_run(&self, run_id: &RunId) -> Result<ReportedRun, ClientError> {
        let gate = self.gate.lock().clone();
        let response = {
            let mut state = self.state.lock();
            state.get_run_calls += 1;
            match state.queued.pop_front() {
                Some(r) => r,
                None => state
                    .run
                    .clone()
                    .ok_or_else(|| (404, format!("run {run_id} not found"))),
            }
        };
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
        let body = response.map_err(backend)?;
        wire::decode_run(&body).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    async fn get_run_logs(&self, run_id: &RunId) -> Result<Vec<LogLine>, ClientError> {
        let lines = self.state.lock().logs.clone();
        Ok(lines
            .into_iter()
            .enumerate()
            .map(|(i, text)| LogLine {
                run_id: run_id.clone(),
                text,
                arrival_order: i as u64,
            })
            .collect())
    }

    async fn create_run(&self, request: &CreateRunRequest) -> Result<ReportedRun, ClientError> {
        let mut state = self.state.lock();
        state.created += 1;
        let status = if request.auto_start { "Running" } else { "Pending" };
        let body = serde_json::json!({ "id": 100 + state.created, "status": status, "stages": [] });
        wire::decode_run(&body).map_err(|e| ClientError::Protocol(e.to_string()))
    }

    async fn start_run(&self, _run_id: &RunId) -> Result<(), ClientError> {
        Ok(())
    }

    async fn retry_stage(&self, run_id: &RunId, stage_type: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        state
            .retry_calls
            .push((run_id.clone(), stage_type.to_string()));
        match state.retry_failure.take() {
            Some(failure) => Err(backend(failure)),
            None => Ok(()),
        }
    }
}
