#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! pipewatch — live view of multi-stage pipeline runs.
//!
//! The building blocks, leaves first:
//! - `stage` — stage status state machine
//! - `protocol` / `transport` — hub framing and the WebSocket push channel
//! - `connection` — connect, keep-alive, reconnect with backoff
//! - `subscriptions` — run rooms that survive reconnects
//! - `dispatcher` — typed event bus for inbound hub events
//! - `jobs` — background job progress and the notification inbox
//! - `client` — REST endpoints for pipeline runs
//! - `run_view` — snapshot + live logs + polling for one run
//! - `session` — the application-scoped context tying it together

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod jobs;
pub mod model;
pub mod protocol;
pub mod run_view;
pub mod session;
pub mod stage;
pub mod subscriptions;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

// Re-export key types at crate root for convenience.
pub use client::{PipelineClient, RunsApi};
pub use config::Config;
pub use connection::{ConnectionState, HubConnection};
pub use dispatcher::{EventDispatcher, HubEvent};
pub use error::{ClientError, ConfigError, HubError, ParseError, SyncError};
pub use jobs::{Job, JobTracker, Notification, NotificationKind};
pub use model::{Run, RunId, RunStatus, Stage};
pub use run_view::{PollOutcome, RunView, ViewPhase, ViewSnapshot};
pub use session::Session;
pub use stage::StageStatus;
