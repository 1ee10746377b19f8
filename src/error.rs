//! Error taxonomy.
//!
//! Connection-level failures ([`HubError`]) are recovered locally by the
//! reconnect loop and only become visible as connection state. Data-level
//! failures ([`SyncError`], [`ClientError`], [`ParseError`]) are surfaced to
//! the operator but never leave a run view in an undefined phase.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from loading `pipewatch.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Push-channel errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    /// No token available, or the server refused the one we sent.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Connection drop, refused connect, handshake failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The connection manager has been stopped.
    #[error("connection closed")]
    Closed,
}

impl HubError {
    pub fn is_auth(&self) -> bool {
        matches!(self, HubError::Auth(_))
    }
}

/// Errors returned by the REST client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP transport error (connection refused, DNS failure, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The backend returned a non-2xx HTTP status.
    #[error("backend error (HTTP {status}): {message}")]
    Backend { status: u16, message: String },
    /// The response body did not match the wire schema.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// No bearer token could be obtained for the request.
    #[error("no auth token available")]
    MissingToken,
    /// The call did not complete within the configured timeout.
    #[error("request timed out after {0} ms")]
    Timeout(u64),
}

impl ClientError {
    /// Returns `true` if the error is an HTTP 404 Not Found response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Backend { status: 404, .. })
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            ClientError::MissingToken | ClientError::Backend { status: 401 | 403, .. }
        )
    }
}

/// A payload field that could not be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ParseError {
    pub field: String,
    pub message: String,
}

impl ParseError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced by a run view.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    /// The initial snapshot could not be loaded.
    #[error("failed to load run {run_id}: {message}")]
    Snapshot { run_id: String, message: String },
    /// A poll tick failed; polling for the run has stopped.
    #[error("polling run {run_id} failed: {message}")]
    Poll { run_id: String, message: String },
    /// The backend rejected or did not answer a retry command.
    #[error("retrying stage {stage_type} of run {run_id} failed: {message}")]
    RetryCommand {
        run_id: String,
        stage_type: String,
        message: String,
    },
    /// An operation that needs an open run was called on an idle view.
    #[error("no run is open in this view")]
    NoRun,
}
