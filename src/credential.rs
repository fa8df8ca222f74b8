//! Directory token loaded from a file and reloaded on SIGHUP.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use pingora::services::background::BackgroundService;
use thiserror::Error;
use tokio::signal::unix::{SignalKind, signal};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read token from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("token file {0:?} is empty")]
    Empty(PathBuf),
}

/// Secret used to authenticate against the service directory.
///
/// Without a path the credential stays anonymous and `load` is a no-op.
#[derive(Debug, Default)]
pub struct Credential {
    path: Option<PathBuf>,
    secret: RwLock<Option<String>>,
}

impl Credential {
    pub fn new(path: Option<PathBuf>) -> Self {
        Credential {
            path,
            secret: RwLock::new(None),
        }
    }

    /// Anonymous credential with a fixed secret.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Credential {
            path: None,
            secret: RwLock::new(Some(secret.into())),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn secret(&self) -> Option<String> {
        self.secret
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Read the token file, replacing the current secret on success.
    ///
    /// On failure the previous secret is kept.
    pub fn load(&self) -> Result<(), CredentialError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let token = std::fs::read_to_string(path).map_err(|source| CredentialError::Read {
            path: path.clone(),
            source,
        })?;
        let token = token.trim();
        if token.is_empty() {
            return Err(CredentialError::Empty(path.clone()));
        }

        *self.secret.write().unwrap_or_else(PoisonError::into_inner) = Some(token.to_string());
        Ok(())
    }
}

/// Background service re-reading the credential whenever SIGHUP arrives.
pub struct CredentialReloader {
    credential: Arc<Credential>,
}

impl CredentialReloader {
    pub fn new(credential: Arc<Credential>) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl BackgroundService for CredentialReloader {
    async fn start(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut reload = match signal(SignalKind::hangup()) {
            Ok(reload) => reload,
            Err(e) => {
                log::error!("token.error: cannot watch SIGHUP: {}", e);
                return;
            }
        };
        log::info!("token.started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    break;
                }
                received = reload.recv() => {
                    if received.is_none() {
                        break;
                    }
                    log::info!("token.reloading path={:?}", self.credential.path());
                    if let Err(e) = self.credential.load() {
                        log::error!("token.error: {}", e);
                    }
                }
            }
        }

        log::info!("token.stopped");
    }
}
