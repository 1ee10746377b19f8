//! Typed event bus between the push channel and its consumers.
//!
//! The connection's I/O task decodes each hub invocation into a [`HubEvent`]
//! (see [`crate::wire::decode_event`]) and calls [`EventDispatcher::dispatch`].
//! Handlers registered for that [`EventKind`] run synchronously, in
//! registration order, on the I/O task. They must not block and must be
//! idempotent: reconnects can replay a payload.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::model::RunId;

/// `JobProgress` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub job_id: String,
    /// 0–100, absent when the event only carries a status change.
    pub progress: Option<u8>,
    pub status: Option<String>,
}

/// `JobCompleted` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobCompleted {
    pub job_id: String,
    pub success: bool,
    pub message: Option<String>,
}

/// `ReceiveLog` payload. Only delivered for rooms this client joined; the
/// run id is present when the backend scopes the message explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub run_id: Option<RunId>,
    pub message: String,
}

/// Inbound events consumed by this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HubEvent {
    JobProgress(JobProgress),
    JobCompleted(JobCompleted),
    ReceiveLog(LogEvent),
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HubEvent::JobProgress(_) => EventKind::JobProgress,
            HubEvent::JobCompleted(_) => EventKind::JobCompleted,
            HubEvent::ReceiveLog(_) => EventKind::ReceiveLog,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JobProgress,
    JobCompleted,
    ReceiveLog,
}

/// Token returned by [`EventDispatcher::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&HubEvent) + Send + Sync>;

struct Registration {
    id: HandlerId,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<Registration>,
}

/// Routes decoded events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    registry: Mutex<Registry>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&HubEvent) + Send + Sync + 'static,
    {
        let mut reg = self.registry.lock();
        reg.next_id += 1;
        let id = HandlerId(reg.next_id);
        reg.handlers.push(Registration {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    pub fn on_job_progress<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&JobProgress) + Send + Sync + 'static,
    {
        self.on(EventKind::JobProgress, move |event| {
            if let HubEvent::JobProgress(p) = event {
                handler(p);
            }
        })
    }

    pub fn on_job_completed<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&JobCompleted) + Send + Sync + 'static,
    {
        self.on(EventKind::JobCompleted, move |event| {
            if let HubEvent::JobCompleted(c) = event {
                handler(c);
            }
        })
    }

    pub fn on_log<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&LogEvent) + Send + Sync + 'static,
    {
        self.on(EventKind::ReceiveLog, move |event| {
            if let HubEvent::ReceiveLog(l) = event {
                handler(l);
            }
        })
    }

    /// Unregister a handler. Returns `false` if it was already gone.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut reg = self.registry.lock();
        let before = reg.handlers.len();
        reg.handlers.retain(|r| r.id != id);
        reg.handlers.len() != before
    }

    /// Deliver `event` to every handler of its kind.
    ///
    /// Handlers are collected before any of them runs, so a handler may
    /// register or unregister others without deadlocking; such changes take
    /// effect from the next dispatch.
    pub fn dispatch(&self, event: &HubEvent) -> usize {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .registry
            .lock()
            .handlers
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| Arc::clone(&r.handler))
            .collect();
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.registry
            .lock()
            .handlers
            .iter()
            .filter(|r| r.kind == kind)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(message: &str) -> HubEvent {
        HubEvent::ReceiveLog(LogEvent {
            run_id: None,
            message: message.into(),
        })
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            dispatcher.on_log(move |_| seen.lock().push(tag));
        }
        assert_eq!(dispatcher.dispatch(&log("x")), 3);
        assert_eq!(*seen.lock(), ["a", "b", "c"]);
    }

    #[test]
    fn handlers_only_see_their_kind() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        dispatcher.on_job_progress(move |_| *c.lock() += 1);

        dispatcher.dispatch(&log("ignored"));
        dispatcher.dispatch(&HubEvent::JobProgress(JobProgress {
            job_id: "1".into(),
            progress: Some(10),
            status: None,
        }));
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn off_removes_only_that_handler() {
        let dispatcher = EventDispatcher::new();
        let a = dispatcher.on_log(|_| {});
        let _b = dispatcher.on_log(|_| {});
        assert!(dispatcher.off(a));
        assert!(!dispatcher.off(a));
        assert_eq!(dispatcher.handler_count(EventKind::ReceiveLog), 1);
    }

    #[test]
    fn handler_may_unregister_itself_during_dispatch() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));
        let d = Arc::clone(&dispatcher);
        let s = Arc::clone(&slot);
        let id = dispatcher.on_log(move |_| {
            if let Some(id) = s.lock().take() {
                d.off(id);
            }
        });
        *slot.lock() = Some(id);

        assert_eq!(dispatcher.dispatch(&log("once")), 1);
        assert_eq!(dispatcher.dispatch(&log("twice")), 0);
    }
}
