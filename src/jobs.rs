//! Background job tracking and the notification inbox.
//!
//! [`JobTracker`] is session-wide. It is fed `JobProgress`/`JobCompleted`
//! events by the dispatcher, keeps the set of in-flight jobs, and turns
//! finished jobs into notifications. Run views also post their warnings and
//! errors here so every surface reads one inbox.

use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::dispatcher::{EventDispatcher, HandlerId, JobCompleted, JobProgress};
use crate::model::now_ms;

pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 50;

/// Notification title for a job that finished successfully.
pub const TITLE_JOB_SUCCEEDED: &str = "İşlem Tamamlandı";
/// Notification title for a job that failed.
pub const TITLE_JOB_FAILED: &str = "İşlem Başarısız";

const DEFAULT_STATUS_TEXT: &str = "Starting";

/// How many completed job ids are remembered to absorb redelivered events.
const FINISHED_JOB_MEMORY: usize = 256;

/// An in-flight background job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: String,
    pub title: String,
    /// 0–100.
    pub progress: u8,
    pub status_text: String,
    pub started_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: Uuid,
    pub title: String,
    pub message: Option<String>,
    pub kind: NotificationKind,
    pub timestamp_ms: u64,
    pub read: bool,
}

struct State {
    /// Insertion order is creation order.
    jobs: IndexMap<String, Job>,
    /// Newest first.
    notifications: VecDeque<Notification>,
    capacity: usize,
    /// Recently completed job ids, oldest first.
    finished: IndexSet<String>,
}

/// Session-wide job and notification registry.
pub struct JobTracker {
    state: Mutex<State>,
    revision: watch::Sender<u64>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_CAPACITY)
    }
}

impl JobTracker {
    pub fn new(notification_capacity: usize) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Mutex::new(State {
                jobs: IndexMap::new(),
                notifications: VecDeque::new(),
                capacity: notification_capacity.max(1),
                finished: IndexSet::new(),
            }),
            revision,
        }
    }

    /// Register `JobProgress`/`JobCompleted` handlers on `dispatcher`.
    pub fn attach(self: &Arc<Self>, dispatcher: &EventDispatcher) -> [HandlerId; 2] {
        let progress = Arc::clone(self);
        let completed = Arc::clone(self);
        [
            dispatcher.on_job_progress(move |event| progress.on_job_progress(event)),
            dispatcher.on_job_completed(move |event| completed.on_job_completed(event)),
        ]
    }

    /// Start tracking a job under a human-readable title before its first
    /// progress event arrives. No-op if the job is already known.
    pub fn track(&self, job_id: &str, title: &str) {
        let inserted = {
            let mut state = self.state.lock();
            if state.jobs.contains_key(job_id) {
                false
            } else {
                state
                    .jobs
                    .insert(job_id.to_string(), new_job(job_id, Some(title)));
                true
            }
        };
        if inserted {
            self.bump();
        }
    }

    /// Progress for a job that already completed is ignored.
    pub fn on_job_progress(&self, event: &JobProgress) {
        {
            let mut state = self.state.lock();
            if state.finished.contains(&event.job_id) {
                tracing::debug!(job_id = %event.job_id, "progress for finished job ignored");
                return;
            }
            let job = state
                .jobs
                .entry(event.job_id.clone())
                .or_insert_with(|| new_job(&event.job_id, None));
            if let Some(progress) = event.progress {
                job.progress = progress.min(100);
            }
            if let Some(status) = &event.status {
                job.status_text.clone_from(status);
            }
            tracing::debug!(
                job_id = %job.id,
                progress = job.progress,
                status = %job.status_text,
                "job progress"
            );
        }
        self.bump();
    }

    /// A redelivered completion for the same job is ignored.
    pub fn on_job_completed(&self, event: &JobCompleted) {
        let finished = {
            let mut state = self.state.lock();
            if !state.finished.insert(event.job_id.clone()) {
                tracing::debug!(job_id = %event.job_id, "duplicate job completion ignored");
                return;
            }
            if state.finished.len() > FINISHED_JOB_MEMORY {
                state.finished.shift_remove_index(0);
            }
            state.jobs.shift_remove(&event.job_id)
        };
        let (kind, title) = if event.success {
            (NotificationKind::Success, TITLE_JOB_SUCCEEDED)
        } else {
            (NotificationKind::Error, TITLE_JOB_FAILED)
        };
        let message = event
            .message
            .clone()
            .or_else(|| finished.map(|job| job.title));
        tracing::info!(job_id = %event.job_id, success = event.success, "job completed");
        self.notify(kind, title, message);
    }

    /// In-flight jobs, oldest first.
    pub fn list_active_jobs(&self) -> Vec<Job> {
        self.state.lock().jobs.values().cloned().collect()
    }

    pub fn active_job_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Append a notification, evicting the oldest when full.
    pub fn notify(
        &self,
        kind: NotificationKind,
        title: &str,
        message: Option<String>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        {
            let mut state = self.state.lock();
            state.notifications.push_front(Notification {
                id,
                title: title.to_string(),
                message,
                kind,
                timestamp_ms: now_ms(),
                read: false,
            });
            let capacity = state.capacity;
            state.notifications.truncate(capacity);
        }
        self.bump();
        id
    }

    /// Notifications, newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.state.lock().notifications.iter().cloned().collect()
    }

    pub fn mark_read(&self, id: Uuid) -> bool {
        let found = {
            let mut state = self.state.lock();
            match state.notifications.iter_mut().find(|n| n.id == id) {
                Some(n) if !n.read => {
                    n.read = true;
                    true
                }
                _ => false,
            }
        };
        if found {
            self.bump();
        }
        found
    }

    pub fn mark_all_read(&self) {
        let changed = {
            let mut state = self.state.lock();
            let mut changed = false;
            for n in state.notifications.iter_mut().filter(|n| !n.read) {
                n.read = true;
                changed = true;
            }
            changed
        };
        if changed {
            self.bump();
        }
    }

    pub fn unread_count(&self) -> usize {
        self.state
            .lock()
            .notifications
            .iter()
            .filter(|n| !n.read)
            .count()
    }

    /// Revision counter bumped on every change to jobs or notifications.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

fn new_job(job_id: &str, title: Option<&str>) -> Job {
    Job {
        id: job_id.to_string(),
        title: title.map_or_else(|| format!("Job {job_id}"), String::from),
        progress: 0,
        status_text: DEFAULT_STATUS_TEXT.to_string(),
        started_at_ms: now_ms(),
    }
}
