//! Application-scoped session context.
//!
//! A [`Session`] owns everything that exists once per logged-in operator:
//! the hub connection, the subscription registry, the event dispatcher, the
//! job tracker and the REST client. Run views are created from it and share
//! those parts.

use std::sync::Arc;

use crate::auth::{TokenProvider, TokenSource};
use crate::client::{PipelineClient, RunsApi};
use crate::config::Config;
use crate::connection::{ConnectionSettings, HubConnection};
use crate::dispatcher::EventDispatcher;
use crate::error::{ClientError, HubError};
use crate::jobs::JobTracker;
use crate::run_view::{RunView, ViewSettings};
use crate::subscriptions::SubscriptionRegistry;
use crate::transport::{Transport, WebSocketTransport};

/// Collaborators a session is assembled from.
pub struct SessionParts {
    pub api: Arc<dyn RunsApi>,
    pub transport: Arc<dyn Transport>,
    pub tokens: Arc<dyn TokenProvider>,
    pub connection: ConnectionSettings,
    pub views: ViewSettings,
    pub notification_capacity: usize,
}

pub struct Session {
    api: Arc<dyn RunsApi>,
    subscriptions: Arc<SubscriptionRegistry>,
    dispatcher: Arc<EventDispatcher>,
    jobs: Arc<JobTracker>,
    connection: HubConnection,
    view_settings: ViewSettings,
}

impl Session {
    /// Build a session talking to the backend described by `config`.
    /// Nothing touches the network until [`Session::connect`].
    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        let tokens = TokenSource::from_config(&config.auth).shared();
        let api = PipelineClient::new(
            &config.api.base_url,
            config.api.request_timeout(),
            Arc::clone(&tokens),
        )?;
        Ok(Self::with_parts(SessionParts {
            api: Arc::new(api),
            transport: Arc::new(WebSocketTransport::new(config.hub.url.clone())),
            tokens,
            connection: ConnectionSettings::from_config(&config.hub),
            views: ViewSettings::from_config(config),
            notification_capacity: config.sync.notification_capacity,
        }))
    }

    pub fn with_parts(parts: SessionParts) -> Self {
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(EventDispatcher::new());
        let jobs = Arc::new(JobTracker::new(parts.notification_capacity));
        jobs.attach(&dispatcher);
        let connection = HubConnection::new(
            parts.connection,
            parts.transport,
            parts.tokens,
            Arc::clone(&subscriptions),
            Arc::clone(&dispatcher),
        );
        Self {
            api: parts.api,
            subscriptions,
            dispatcher,
            jobs,
            connection,
            view_settings: parts.views,
        }
    }

    /// Open the push channel. Run views work without it (polling only) but
    /// receive no live log lines or job events.
    pub async fn connect(&self) -> Result<(), HubError> {
        self.connection.connect().await
    }

    /// Close the push channel. Idempotent.
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    /// A new, idle run view bound to this session.
    pub fn run_view(&self) -> RunView {
        RunView::new(
            Arc::clone(&self.api),
            Arc::clone(&self.jobs),
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.dispatcher),
            self.view_settings.clone(),
        )
    }

    pub fn connection(&self) -> &HubConnection {
        &self.connection
    }

    pub fn api(&self) -> &Arc<dyn RunsApi> {
        &self.api
    }

    pub fn jobs(&self) -> &Arc<JobTracker> {
        &self.jobs
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::model::RunId;
    use crate::protocol::HubMessage;
    use crate::testing::{FakeApi, MockTransport};
    use crate::wire;

    fn session(api: Arc<FakeApi>, transport: Arc<MockTransport>) -> Session {
        Session::with_parts(SessionParts {
            api,
            transport,
            tokens: TokenSource::Static("t0k".into()).shared(),
            connection: ConnectionSettings::default(),
            views: ViewSettings::default(),
            notification_capacity: 50,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn live_events_flow_from_hub_to_view_and_jobs() {
        let api = Arc::new(FakeApi::new());
        api.set_run(json!({ "id": 42, "status": "Running", "stages": [] }));
        let transport = Arc::new(MockTransport::new());
        let session = session(Arc::clone(&api), Arc::clone(&transport));

        session.connect().await.unwrap();
        let mut server = transport.accept().await;
        let view = session.run_view();
        view.open(RunId::from(42)).await.unwrap();
        assert_eq!(
            server.recv_invocation().await,
            Some(HubMessage::invoke(wire::INVOKE_JOIN_RUN_GROUP, vec![json!("42")]))
        );

        server.send(HubMessage::invoke(
            wire::EVENT_RECEIVE_LOG,
            vec![json!("rendering frame 1")],
        ));
        server.send(HubMessage::invoke(
            wire::EVENT_JOB_PROGRESS,
            vec![json!({ "jobId": "j1", "progress": 40, "status": "Rendering" })],
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(view.snapshot().logs[0].text, "rendering frame 1");
        assert_eq!(session.jobs().list_active_jobs()[0].status_text, "Rendering");

        drop(view);
        assert_eq!(
            server.recv_invocation().await,
            Some(HubMessage::invoke(wire::INVOKE_LEAVE_RUN_GROUP, vec![json!("42")]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn views_work_without_the_push_channel() {
        let api = Arc::new(FakeApi::new());
        api.set_run(json!({ "id": 1, "status": "Completed", "stages": [] }));
        let session = session(Arc::clone(&api), Arc::new(MockTransport::new()));

        let view = session.run_view();
        view.open(RunId::from(1)).await.unwrap();
        assert_eq!(view.phase(), crate::run_view::ViewPhase::Settled);
        assert!(!session.connection().is_connected());
    }
}
