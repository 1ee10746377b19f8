//! Bearer token sources.
//!
//! The connection manager and the REST client ask the provider for a token
//! on every connection attempt and every request, so a token file rewritten
//! by an external login flow is picked up without restarting.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::AuthConfig;

/// Supplies the current bearer token, or `None` when logged out.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Where tokens come from.
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// A fixed token (config file or `PIPEWATCH_TOKEN`).
    Static(String),
    /// A file re-read on each call; surrounding whitespace is ignored.
    File(PathBuf),
    /// No token configured.
    None,
}

impl TokenSource {
    pub fn from_config(auth: &AuthConfig) -> Self {
        if let Some(path) = &auth.token_file {
            TokenSource::File(path.clone())
        } else if let Some(token) = auth.token.as_ref().filter(|t| !t.trim().is_empty()) {
            TokenSource::Static(token.trim().to_string())
        } else {
            TokenSource::None
        }
    }

    pub fn shared(self) -> Arc<dyn TokenProvider> {
        Arc::new(self)
    }
}

impl TokenProvider for TokenSource {
    fn token(&self) -> Option<String> {
        match self {
            TokenSource::Static(token) => Some(token.clone()),
            TokenSource::File(path) => match std::fs::read_to_string(path) {
                Ok(content) => {
                    let token = content.trim();
                    if token.is_empty() {
                        tracing::debug!(path = %path.display(), "token file is empty");
                        None
                    } else {
                        Some(token.to_string())
                    }
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), "cannot read token file: {e}");
                    None
                }
            },
            TokenSource::None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_wins_over_static_token() {
        let auth = AuthConfig {
            token: Some("abc".into()),
            token_file: Some(PathBuf::from("/nonexistent/pipewatch-token")),
        };
        let source = TokenSource::from_config(&auth);
        assert!(matches!(source, TokenSource::File(_)));
        assert_eq!(source.token(), None);
    }

    #[test]
    fn blank_static_token_means_none() {
        let auth = AuthConfig {
            token: Some("  ".into()),
            token_file: None,
        };
        assert!(matches!(TokenSource::from_config(&auth), TokenSource::None));
    }

    #[test]
    fn file_token_is_reread_and_trimmed() {
        let path = std::env::temp_dir().join(format!("pipewatch-token-{}", uuid::Uuid::new_v4()));
        let source = TokenSource::File(path.clone());
        std::fs::write(&path, "first\n").unwrap();
        assert_eq!(source.token().as_deref(), Some("first"));
        std::fs::write(&path, "second").unwrap();
        assert_eq!(source.token().as_deref(), Some("second"));
        std::fs::remove_file(&path).unwrap();
        assert_eq!(source.token(), None);
    }
}
