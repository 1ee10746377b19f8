//! Push-channel connection manager.
//!
//! One [`HubConnection`] per session owns the hub connection and keeps it
//! alive. A background I/O task reads inbound messages and hands them to the
//! [`EventDispatcher`], sends `JoinRunGroup`/`LeaveRunGroup` whenever the
//! [`SubscriptionRegistry`] changes, pings the server, and reconnects with
//! exponential backoff when the connection drops.
//!
//! Every (re)connect replays the registry before the state becomes
//! `Connected`, so observers never see `Connected` while a room is missing.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenProvider;
use crate::config::HubConfig;
use crate::dispatcher::EventDispatcher;
use crate::error::HubError;
use crate::protocol::HubMessage;
use crate::subscriptions::SubscriptionRegistry;
use crate::transport::{Channel, FrameSink, Transport};
use crate::wire;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Retry and keep-alive policy.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub reconnect_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub keepalive_interval: Duration,
    pub server_timeout: Duration,
}

impl ConnectionSettings {
    pub fn from_config(hub: &HubConfig) -> Self {
        Self {
            reconnect_delay: Duration::from_millis(hub.reconnect_delay_ms),
            reconnect_max_delay: Duration::from_millis(hub.reconnect_max_delay_ms),
            max_reconnect_attempts: hub.max_reconnect_attempts,
            keepalive_interval: Duration::from_millis(hub.keepalive_interval_ms),
            server_timeout: Duration::from_millis(hub.server_timeout_ms),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&HubConfig::default())
    }
}

type StateObserver = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct StateCell {
    state: ConnectionState,
    /// Bumped by `disconnect()`; a task from an older epoch may no longer
    /// change state.
    epoch: u64,
}

struct Inner {
    settings: ConnectionSettings,
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenProvider>,
    subscriptions: Arc<SubscriptionRegistry>,
    dispatcher: Arc<EventDispatcher>,
    cell: Mutex<StateCell>,
    observers: Mutex<Vec<StateObserver>>,
    last_error: Mutex<Option<HubError>>,
}

impl Inner {
    /// Move to `next` if `epoch` is still current. Observers run after the
    /// lock is released, once per real change.
    fn transition(&self, epoch: u64, next: ConnectionState) -> bool {
        let changed = {
            let mut cell = self.cell.lock();
            if cell.epoch != epoch {
                return false;
            }
            if cell.state == next {
                None
            } else {
                let prev = cell.state;
                cell.state = next;
                Some(prev)
            }
        };
        if let Some(prev) = changed {
            self.notify(prev, next);
        }
        true
    }

    /// Move from `Disconnected` to `Connecting` in one step. Returns the
    /// current epoch, or `None` when another caller got there first.
    fn claim_connect(&self) -> Option<u64> {
        let epoch = {
            let mut cell = self.cell.lock();
            if cell.state != ConnectionState::Disconnected {
                return None;
            }
            cell.state = ConnectionState::Connecting;
            cell.epoch
        };
        self.notify(ConnectionState::Disconnected, ConnectionState::Connecting);
        Some(epoch)
    }

    fn notify(&self, prev: ConnectionState, next: ConnectionState) {
        tracing::debug!(from = %prev, to = %next, "connection state changed");
        let observers: Vec<StateObserver> = self.observers.lock().clone();
        for observer in &observers {
            observer(next);
        }
    }

    fn record_error(&self, error: HubError) {
        *self.last_error.lock() = Some(error);
    }
}

/// Manages the session's single hub connection.
pub struct HubConnection {
    inner: Arc<Inner>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl HubConnection {
    pub fn new(
        settings: ConnectionSettings,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenProvider>,
        subscriptions: Arc<SubscriptionRegistry>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                transport,
                tokens,
                subscriptions,
                dispatcher,
                cell: Mutex::new(StateCell {
                    state: ConnectionState::Disconnected,
                    epoch: 0,
                }),
                observers: Mutex::new(Vec::new()),
                last_error: Mutex::new(None),
            }),
            cancel: Mutex::new(None),
        }
    }

    /// Register a state observer. Called synchronously on every transition.
    pub fn on_state_change<F>(&self, observer: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.inner.observers.lock().push(Arc::new(observer));
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.cell.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The most recent connection failure, kept until the next one.
    pub fn last_error(&self) -> Option<HubError> {
        self.inner.last_error.lock().clone()
    }

    /// Open the connection and start the background I/O task.
    ///
    /// Fails with [`HubError::Auth`] without touching the network when no
    /// token is available. Calling `connect` while a connection is live or
    /// already being opened is a no-op.
    pub async fn connect(&self) -> Result<(), HubError> {
        if self.state() != ConnectionState::Disconnected {
            return Ok(());
        }

        let Some(token) = self.inner.tokens.token() else {
            let err = HubError::Auth("no token available".into());
            self.inner.record_error(err.clone());
            return Err(err);
        };

        let Some(epoch) = self.inner.claim_connect() else {
            tracing::debug!("hub connect already in progress");
            return Ok(());
        };
        let mut channel = match self.inner.transport.open(&token).await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!("hub connect failed: {e}");
                self.inner.record_error(e.clone());
                self.inner.transition(epoch, ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.inner.subscriptions.reset_joined();
        if let Err(e) = sync_rooms(&self.inner.subscriptions, &mut channel.sink).await {
            self.inner.record_error(e.clone());
            self.inner.transition(epoch, ConnectionState::Disconnected);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        if !self.inner.transition(epoch, ConnectionState::Connected) {
            // disconnect() raced us
            return Err(HubError::Closed);
        }
        *self.cancel.lock() = Some(cancel.clone());
        tracing::info!("hub connected");

        tokio::spawn(io_task(Arc::clone(&self.inner), channel, cancel, epoch));
        Ok(())
    }

    /// Tear down the connection and stop reconnecting. Idempotent.
    pub fn disconnect(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        let epoch = {
            let mut cell = self.inner.cell.lock();
            cell.epoch += 1;
            cell.epoch
        };
        self.inner.subscriptions.reset_joined();
        if self.inner.transition(epoch, ConnectionState::Disconnected) {
            tracing::info!("hub disconnected");
        }
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
    }
}

/// Why a connection's read loop ended.
enum SessionEnd {
    Cancelled,
    /// Server close that forbids reconnecting.
    Closed(Option<String>),
    Lost(HubError),
}

async fn io_task(inner: Arc<Inner>, mut channel: Channel, cancel: CancellationToken, epoch: u64) {
    loop {
        match drive(&inner, &mut channel, &cancel).await {
            SessionEnd::Cancelled => return,
            SessionEnd::Closed(reason) => {
                tracing::info!(reason = ?reason, "hub closed the connection without reconnect");
                inner.record_error(HubError::Transport(
                    reason.unwrap_or_else(|| "closed by server".into()),
                ));
                inner.subscriptions.reset_joined();
                inner.transition(epoch, ConnectionState::Disconnected);
                return;
            }
            SessionEnd::Lost(err) => {
                tracing::warn!("hub connection lost: {err}");
                inner.record_error(err);
                inner.subscriptions.reset_joined();
                if !inner.transition(epoch, ConnectionState::Reconnecting) {
                    return;
                }
                match reconnect(&inner, &cancel, epoch).await {
                    Some(next) => channel = next,
                    None => return,
                }
            }
        }
    }
}

/// Pump one live connection until it ends.
async fn drive(inner: &Inner, channel: &mut Channel, cancel: &CancellationToken) -> SessionEnd {
    let keepalive = inner.settings.keepalive_interval;
    let mut ping = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    loop {
        let deadline = last_seen + inner.settings.server_timeout;
        tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            msg = channel.stream.next() => match msg {
                Some(Ok(msg)) => {
                    last_seen = Instant::now();
                    match msg {
                        HubMessage::Invocation { target, arguments } => {
                            handle_invocation(&inner.dispatcher, &target, &arguments);
                        }
                        HubMessage::Close { error, allow_reconnect: false } => {
                            return SessionEnd::Closed(error);
                        }
                        HubMessage::Close { error, allow_reconnect: true } => {
                            return SessionEnd::Lost(HubError::Transport(
                                error.unwrap_or_else(|| "closed by server".into()),
                            ));
                        }
                        HubMessage::Ping | HubMessage::Other(_) => {}
                    }
                }
                Some(Err(e)) => return SessionEnd::Lost(e),
                None => return SessionEnd::Lost(HubError::Transport("connection closed".into())),
            },
            _ = inner.subscriptions.changed() => {
                if let Err(e) = sync_rooms(&inner.subscriptions, &mut channel.sink).await {
                    return SessionEnd::Lost(e);
                }
            }
            _ = ping.tick() => {
                if let Err(e) = channel.sink.send(HubMessage::Ping).await {
                    return SessionEnd::Lost(e);
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                return SessionEnd::Lost(HubError::Transport(format!(
                    "no message from server in {:?}",
                    inner.settings.server_timeout
                )));
            }
        }
    }
}

fn handle_invocation(dispatcher: &EventDispatcher, target: &str, arguments: &[serde_json::Value]) {
    match wire::decode_event(target, arguments) {
        Ok(Some(event)) => {
            dispatcher.dispatch(&event);
        }
        Ok(None) => tracing::debug!(target, "ignoring unknown hub event"),
        Err(e) => tracing::warn!(target, "dropping undecodable hub event: {e}"),
    }
}

/// Send whatever joins and leaves the registry is waiting on.
async fn sync_rooms(registry: &SubscriptionRegistry, sink: &mut FrameSink) -> Result<(), HubError> {
    let delta = registry.pending();
    for run_id in delta.leave {
        sink.send(HubMessage::invoke(
            wire::INVOKE_LEAVE_RUN_GROUP,
            vec![json!(run_id.as_str())],
        ))
        .await?;
        registry.mark_left(&run_id);
        tracing::debug!(run_id = %run_id, "left run group");
    }
    for run_id in delta.join {
        sink.send(HubMessage::invoke(
            wire::INVOKE_JOIN_RUN_GROUP,
            vec![json!(run_id.as_str())],
        ))
        .await?;
        if registry.mark_joined(&run_id) {
            tracing::debug!(run_id = %run_id, "joined run group");
        } else {
            sink.send(HubMessage::invoke(
                wire::INVOKE_LEAVE_RUN_GROUP,
                vec![json!(run_id.as_str())],
            ))
            .await?;
        }
    }
    Ok(())
}

/// Reconnect with exponential backoff, replaying the registry on success.
/// Returns `None` when reconnecting stops (cancelled, auth failure, or the
/// attempt cap was hit); the state is already settled in that case.
async fn reconnect(inner: &Inner, cancel: &CancellationToken, epoch: u64) -> Option<Channel> {
    let settings = &inner.settings;
    let mut delay = settings.reconnect_delay;
    let mut attempt: u32 = 0;

    loop {
        if settings.max_reconnect_attempts.is_some_and(|max| attempt >= max) {
            tracing::warn!(attempts = attempt, "giving up on hub reconnect");
            inner.transition(epoch, ConnectionState::Disconnected);
            return None;
        }
        attempt += 1;

        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(token) = inner.tokens.token() else {
            tracing::warn!("no token available, stopping hub reconnect");
            inner.record_error(HubError::Auth("no token available".into()));
            inner.transition(epoch, ConnectionState::Disconnected);
            return None;
        };

        let opened = tokio::select! {
            _ = cancel.cancelled() => return None,
            opened = inner.transport.open(&token) => opened,
        };
        match opened {
            Ok(mut channel) => match sync_rooms(&inner.subscriptions, &mut channel.sink).await {
                Ok(()) => {
                    if !inner.transition(epoch, ConnectionState::Connected) {
                        return None;
                    }
                    tracing::info!(attempt, "hub reconnected");
                    return Some(channel);
                }
                Err(e) => {
                    tracing::warn!(attempt, "room replay failed: {e}");
                    inner.record_error(e);
                    inner.subscriptions.reset_joined();
                }
            },
            Err(e) if e.is_auth() => {
                tracing::warn!("hub rejected credentials, stopping reconnect: {e}");
                inner.record_error(e);
                inner.transition(epoch, ConnectionState::Disconnected);
                return None;
            }
            Err(e) => {
                tracing::warn!(attempt, "reconnect failed: {e}, retrying in {delay:?}");
                inner.record_error(e);
            }
        }
        delay = (delay * 2).min(settings.reconnect_max_delay);
    }
}
