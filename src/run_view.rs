//! Run detail synchronizer.
//!
//! A [`RunView`] shows one run at a time. Opening a run joins its room,
//! loads the run and its log history, then keeps the run fresh by polling
//! until it reaches a terminal status. Live `ReceiveLog` lines for the open
//! run are appended to its log buffer as they arrive.
//!
//! ```text
//! Idle ─open─► LoadingSnapshot ─┬─► Live ──poll terminal──► Settled
//!                               │    │  ▲                    │  ▲
//!                               │    │  │ refresh    retry or │  │ poll
//!                               │    ▼  │       active poll   ▼  │ terminal
//!                               └─► Stalled                  Polling
//! ```
//!
//! A poll is authoritative: a terminal status always stops polling, and an
//! active status always (re)starts it.
//!
//! Each open bumps a generation counter. Results of fetches started under an
//! older generation are discarded, so switching runs can never leak a stale
//! snapshot or log line into the new one.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::client::RunsApi;
use crate::config::Config;
use crate::dispatcher::{EventDispatcher, HandlerId, LogEvent};
use crate::error::{ClientError, SyncError};
use crate::jobs::{JobTracker, NotificationKind};
use crate::model::{LogLine, Run, RunId, RunStatus};
use crate::stage::{self, StageStatus, TransitionCause};
use crate::subscriptions::SubscriptionRegistry;
use crate::wire::ReportedRun;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViewPhase {
    Idle,
    LoadingSnapshot,
    Live,
    /// Polling resumed by a retry command.
    Polling,
    Settled,
    /// Polling stopped after a failed poll or snapshot load.
    Stalled,
}

#[derive(Debug, Clone)]
pub struct ViewSettings {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl ViewSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.sync.poll_interval(),
            request_timeout: config.api.request_timeout(),
        }
    }
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Point-in-time copy of a view.
#[derive(Debug, Clone)]
pub struct ViewSnapshot {
    pub run_id: Option<RunId>,
    pub phase: ViewPhase,
    pub run: Option<Run>,
    pub logs: Vec<LogLine>,
    pub last_error: Option<SyncError>,
    pub polling: bool,
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The run was refreshed and is still active.
    Updated(RunStatus),
    /// The run reached a terminal status; polling stopped.
    Settled(RunStatus),
    /// Another poll was already in flight.
    Skipped,
    /// The view moved to another run (or closed) while fetching.
    Stale,
    /// The fetch failed; the view is stalled.
    Failed(SyncError),
}

struct ViewState {
    generation: u64,
    run_id: Option<RunId>,
    phase: ViewPhase,
    run: Option<Run>,
    logs: Vec<LogLine>,
    next_order: u64,
    last_error: Option<SyncError>,
    poll_task: Option<CancellationToken>,
}

impl ViewState {
    fn stop_polling(&mut self) {
        if let Some(task) = self.poll_task.take() {
            task.cancel();
        }
    }
}

struct Shared {
    api: Arc<dyn RunsApi>,
    jobs: Arc<JobTracker>,
    subscriptions: Arc<SubscriptionRegistry>,
    settings: ViewSettings,
    state: Mutex<ViewState>,
    polling: AtomicBool,
    revision: watch::Sender<u64>,
}

/// Clears the single-flight flag when the poll finishes or is dropped.
struct PollGuard<'a>(&'a AtomicBool);

impl<'a> PollGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Shared {
    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    async fn timed<T>(
        &self,
        fut: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        match tokio::time::timeout(self.settings.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                #[allow(clippy::cast_possible_truncation)]
                let ms = self.settings.request_timeout.as_millis() as u64;
                Err(ClientError::Timeout(ms))
            }
        }
    }

    /// Point the view at `next` (or nothing), cancelling polling and
    /// invalidating in-flight fetches. Returns the previously open run.
    fn reset(&self, next: Option<RunId>) -> (Option<RunId>, u64) {
        let mut state = self.state.lock();
        state.stop_polling();
        state.generation += 1;
        let previous = state.run_id.take();
        state.phase = if next.is_some() {
            ViewPhase::LoadingSnapshot
        } else {
            ViewPhase::Idle
        };
        state.run_id = next;
        state.run = None;
        state.logs.clear();
        state.next_order = 0;
        state.last_error = None;
        (previous, state.generation)
    }

    fn ingest_log(&self, event: &LogEvent) {
        let sole_room = if event.run_id.is_none() {
            self.subscriptions.sole_room()
        } else {
            None
        };
        {
            let mut state = self.state.lock();
            let Some(current) = state.run_id.clone() else {
                return;
            };
            let target = match (&event.run_id, sole_room) {
                (Some(id), _) => id.clone(),
                (None, Some(room)) => room,
                (None, None) => {
                    tracing::debug!("dropping unscoped log line: several rooms joined");
                    return;
                }
            };
            if target != current {
                return;
            }
            let arrival_order = state.next_order;
            state.next_order += 1;
            state.logs.push(LogLine {
                run_id: current,
                text: event.message.clone(),
                arrival_order,
            });
        }
        self.bump();
    }

    fn start_polling(self: &Arc<Self>, state: &mut ViewState) {
        state.stop_polling();
        let cancel = CancellationToken::new();
        state.poll_task = Some(cancel.clone());
        let generation = state.generation;
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(shared.settings.poll_interval) => {}
                }
                match shared.poll(generation).await {
                    PollOutcome::Updated(_) | PollOutcome::Skipped => {}
                    PollOutcome::Settled(_) | PollOutcome::Stale | PollOutcome::Failed(_) => {
                        return
                    }
                }
            }
        });
    }

    async fn load_snapshot(
        self: &Arc<Self>,
        generation: u64,
        run_id: RunId,
    ) -> Result<(), SyncError> {
        let (run, history) = tokio::join!(
            self.timed(self.api.get_run(&run_id)),
            self.timed(self.api.get_run_logs(&run_id)),
        );

        let mut state = self.state.lock();
        if state.generation != generation {
            tracing::debug!(run_id = %run_id, "discarding superseded snapshot");
            return Ok(());
        }
        let report = match run {
            Ok(report) => report,
            Err(e) => {
                let err = SyncError::Snapshot {
                    run_id: run_id.to_string(),
                    message: e.to_string(),
                };
                state.phase = ViewPhase::Stalled;
                state.last_error = Some(err.clone());
                drop(state);
                tracing::warn!(run_id = %run_id, "{err}");
                self.jobs
                    .notify(NotificationKind::Warning, "Run could not be loaded", Some(err.to_string()));
                self.bump();
                return Err(err);
            }
        };

        for issue in report.issues() {
            tracing::warn!(run_id = %run_id, "degraded field in run snapshot: {issue}");
        }
        let run = report.into_run();
        let history = history.unwrap_or_else(|e| {
            tracing::warn!(run_id = %run_id, "log history unavailable: {e}");
            Vec::new()
        });

        // History goes first; live lines that beat the snapshot follow.
        let live = std::mem::take(&mut state.logs);
        state.logs = history
            .into_iter()
            .chain(live)
            .enumerate()
            .map(|(i, mut line)| {
                line.run_id = run_id.clone();
                line.arrival_order = i as u64;
                line
            })
            .collect();
        state.next_order = state.logs.len() as u64;

        let status = run.status;
        state.run = Some(run);
        if status.is_terminal() {
            state.phase = ViewPhase::Settled;
        } else {
            state.phase = ViewPhase::Live;
            self.start_polling(&mut state);
        }
        drop(state);
        tracing::info!(run_id = %run_id, status = %status, "run snapshot loaded");
        self.bump();
        Ok(())
    }

    async fn poll(self: &Arc<Self>, generation: u64) -> PollOutcome {
        let Some(_guard) = PollGuard::acquire(&self.polling) else {
            tracing::debug!("poll already in flight, skipping");
            return PollOutcome::Skipped;
        };
        let run_id = {
            let state = self.state.lock();
            match &state.run_id {
                Some(id) if state.generation == generation => id.clone(),
                _ => return PollOutcome::Stale,
            }
        };

        let result = self.timed(self.api.get_run(&run_id)).await;

        let mut guard = self.state.lock();
        if guard.generation != generation {
            return PollOutcome::Stale;
        }
        let state = &mut *guard;
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                let err = SyncError::Poll {
                    run_id: run_id.to_string(),
                    message: e.to_string(),
                };
                state.stop_polling();
                state.phase = ViewPhase::Stalled;
                state.last_error = Some(err.clone());
                drop(guard);
                tracing::warn!(run_id = %run_id, "{err}");
                self.jobs
                    .notify(NotificationKind::Warning, "Run polling stopped", Some(err.to_string()));
                self.bump();
                return PollOutcome::Failed(err);
            }
        };

        let run = match state.run.take() {
            Some(previous) => reconcile(previous, report),
            None => report.into_run(),
        };
        let status = run.status;
        state.run = Some(run);
        state.last_error = None;

        let mut resumed = false;
        let outcome = if status.is_terminal() {
            state.stop_polling();
            state.phase = ViewPhase::Settled;
            PollOutcome::Settled(status)
        } else {
            if state.poll_task.is_none() {
                state.phase = match state.phase {
                    ViewPhase::Settled | ViewPhase::Polling => ViewPhase::Polling,
                    _ => ViewPhase::Live,
                };
                self.start_polling(state);
                resumed = true;
            }
            PollOutcome::Updated(status)
        };
        drop(guard);
        if resumed {
            tracing::info!(run_id = %run_id, status = %status, "polling resumed");
        }
        tracing::debug!(run_id = %run_id, status = %status, "run polled");
        self.bump();
        outcome
    }
}

/// Merge a polled report into the previous snapshot.
///
/// The report replaces the snapshot wholesale, except that each stage status
/// must be reachable from the previous one; otherwise the previous status is
/// kept.
fn reconcile(previous: Run, report: ReportedRun) -> Run {
    let run_id = report.id.clone();
    let status = match &report.status {
        Ok(status) => *status,
        Err(e) => {
            tracing::warn!(run_id = %run_id, "keeping run status {}: {e}", previous.status);
            previous.status
        }
    };

    let stages = report
        .stages
        .iter()
        .map(|reported| {
            let before = previous.stage(&reported.stage_type).map(|s| s.status);
            let next = match (&reported.status, before) {
                (Ok(next), None) => *next,
                (Ok(next), Some(before)) => match stage::observe(before, *next) {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::warn!(
                            run_id = %run_id,
                            stage = %reported.stage_type,
                            "ignoring reported status: {e}"
                        );
                        before
                    }
                },
                (Err(e), before) => {
                    let kept = before.unwrap_or(StageStatus::Pending);
                    tracing::warn!(
                        run_id = %run_id,
                        stage = %reported.stage_type,
                        "keeping status {kept}: {e}"
                    );
                    kept
                }
            };
            if let Some(before) = before.filter(|b| *b != next) {
                tracing::info!(
                    run_id = %run_id,
                    stage = %reported.stage_type,
                    "stage {before} -> {next}"
                );
            }
            reported.with_status(next)
        })
        .collect();

    Run {
        id: previous.id,
        status,
        started_at: report.started_at,
        completed_at: report.completed_at,
        error_message: report.error_message,
        stages,
    }
}

/// One run detail view.
pub struct RunView {
    shared: Arc<Shared>,
    dispatcher: Arc<EventDispatcher>,
    log_handler: HandlerId,
}

impl RunView {
    pub fn new(
        api: Arc<dyn RunsApi>,
        jobs: Arc<JobTracker>,
        subscriptions: Arc<SubscriptionRegistry>,
        dispatcher: Arc<EventDispatcher>,
        settings: ViewSettings,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            api,
            jobs,
            subscriptions,
            settings,
            state: Mutex::new(ViewState {
                generation: 0,
                run_id: None,
                phase: ViewPhase::Idle,
                run: None,
                logs: Vec::new(),
                next_order: 0,
                last_error: None,
                poll_task: None,
            }),
            polling: AtomicBool::new(false),
            revision,
        });
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let log_handler = dispatcher.on_log(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.ingest_log(event);
            }
        });
        Self {
            shared,
            dispatcher,
            log_handler,
        }
    }

    /// Show `run_id`: join its room, load the run and its log history, and
    /// start polling if it is still active.
    ///
    /// On error the view is left `Stalled` on that run; [`RunView::refresh`]
    /// retries the load.
    pub async fn open(&self, run_id: RunId) -> Result<(), SyncError> {
        let (previous, generation) = self.shared.reset(Some(run_id.clone()));
        if let Some(previous) = previous {
            self.shared.subscriptions.leave(&previous);
        }
        self.shared.subscriptions.join(&run_id);
        self.shared.bump();
        tracing::debug!(run_id = %run_id, "opening run view");
        self.shared.load_snapshot(generation, run_id).await
    }

    /// Stop polling, stop log routing, and leave the run's room.
    pub fn close(&self) {
        let (previous, _) = self.shared.reset(None);
        if let Some(previous) = previous {
            self.shared.subscriptions.leave(&previous);
            tracing::debug!(run_id = %previous, "run view closed");
            self.shared.bump();
        }
    }

    /// Fetch the run once, unless a poll is already in flight. A terminal
    /// result stops polling; an active one restarts it if it had stopped.
    pub async fn poll_once(&self) -> PollOutcome {
        let generation = self.shared.state.lock().generation;
        self.shared.poll(generation).await
    }

    /// Ask the backend to retry `stage_type` of the open run. On success the
    /// stage shows `Retrying` and polling resumes even if the run had settled.
    pub async fn retry_stage(&self, stage_type: &str) -> Result<(), SyncError> {
        let (generation, run_id) = {
            let state = self.shared.state.lock();
            match &state.run_id {
                Some(id) => (state.generation, id.clone()),
                None => return Err(SyncError::NoRun),
            }
        };

        if let Err(e) = self
            .shared
            .timed(self.shared.api.retry_stage(&run_id, stage_type))
            .await
        {
            let err = SyncError::RetryCommand {
                run_id: run_id.to_string(),
                stage_type: stage_type.to_string(),
                message: e.to_string(),
            };
            tracing::warn!("{err}");
            self.shared
                .jobs
                .notify(NotificationKind::Error, "Stage retry failed", Some(err.to_string()));
            return Err(err);
        }

        {
            let mut guard = self.shared.state.lock();
            if guard.generation != generation {
                return Ok(());
            }
            let state = &mut *guard;
            if let Some(run) = state.run.as_mut() {
                if let Some(stage) = run.stage_mut(stage_type) {
                    match stage::step(stage.status, StageStatus::Retrying, TransitionCause::Retry) {
                        Ok(next) => stage.status = next,
                        Err(e) => tracing::warn!(run_id = %run_id, stage = stage_type, "{e}"),
                    }
                }
                if run.status.is_terminal() {
                    run.status = RunStatus::Running;
                }
            }
            state.last_error = None;
            state.phase = ViewPhase::Polling;
            self.shared.start_polling(state);
        }
        tracing::info!(run_id = %run_id, stage = stage_type, "stage retry requested");
        self.shared.bump();
        Ok(())
    }

    /// Poll now. A stalled view resumes polling when the fetch succeeds; a
    /// view whose snapshot never loaded retries the load.
    pub async fn refresh(&self) -> Result<PollOutcome, SyncError> {
        let (generation, run_id, loaded) = {
            let state = self.shared.state.lock();
            match &state.run_id {
                Some(id) => (state.generation, id.clone(), state.run.is_some()),
                None => return Err(SyncError::NoRun),
            }
        };

        if !loaded {
            {
                let mut state = self.shared.state.lock();
                if state.generation != generation {
                    return Ok(PollOutcome::Stale);
                }
                state.phase = ViewPhase::LoadingSnapshot;
                state.last_error = None;
            }
            self.shared.bump();
            self.shared.load_snapshot(generation, run_id).await?;
            let state = self.shared.state.lock();
            return Ok(match state.run.as_ref().map(|r| r.status) {
                Some(status) if status.is_terminal() => PollOutcome::Settled(status),
                Some(status) => PollOutcome::Updated(status),
                None => PollOutcome::Stale,
            });
        }

        Ok(self.shared.poll(generation).await)
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        let state = self.shared.state.lock();
        ViewSnapshot {
            run_id: state.run_id.clone(),
            phase: state.phase,
            run: state.run.clone(),
            logs: state.logs.clone(),
            last_error: state.last_error.clone(),
            polling: state.poll_task.is_some(),
        }
    }

    /// Revision counter bumped on every visible change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub fn phase(&self) -> ViewPhase {
        self.shared.state.lock().phase
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.shared.state.lock().run_id.clone()
    }

    pub fn is_polling(&self) -> bool {
        self.shared.state.lock().poll_task.is_some()
    }
}

impl Drop for RunView {
    fn drop(&mut self) {
        self.close();
        self.dispatcher.off(self.log_handler);
    }
}
