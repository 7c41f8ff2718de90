//! Worker pool of authenticated upstream sessions.
//!
//! The pool is a dispatch structure, not a health monitor: a worker whose
//! background authentication fails stays in the pool, its calls fail, and
//! the request orchestrator rotates away from it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::upstream::{UpstreamApi, UpstreamConnector, WorkerId};

/// Errors raised while interpreting a bot credential.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// The token does not start with a numeric id followed by `:`.
    #[error("bot token has no numeric id prefix: {hint}")]
    MissingIdPrefix {
        /// Redacted token prefix for log correlation.
        hint: String,
    },
}

/// One bot credential as supplied through `BOT_TOKENS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotCredential {
    token: String,
}

impl BotCredential {
    /// Wraps a raw token string.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// The numeric id before the first `:`; doubles as the worker id.
    ///
    /// # Errors
    ///
    /// Returns `CredentialError::MissingIdPrefix` when the token has no
    /// parseable leading id.
    pub fn worker_id(&self) -> Result<WorkerId, CredentialError> {
        self.token
            .split(':')
            .next()
            .and_then(|prefix| prefix.parse::<WorkerId>().ok())
            .ok_or_else(|| CredentialError::MissingIdPrefix {
                hint: self.short().to_string(),
            })
    }

    /// Session file name derived from the token prefix, managed by the
    /// upstream connector.
    pub fn session_name(&self) -> String {
        format!("session_{}.json", self.short())
    }

    /// The raw token, needed for the bot sign-in handshake.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// First eight characters of the token, safe to log.
    pub fn short(&self) -> &str {
        self.token.get(..8).unwrap_or(&self.token)
    }
}

/// One upstream RPC client bound to a bot credential.
///
/// Created at startup and never mutated afterwards.
pub struct Worker {
    id: WorkerId,
    api: Arc<dyn UpstreamApi>,
}

impl Worker {
    /// Binds a session to its worker id.
    pub fn new(id: WorkerId, api: Arc<dyn UpstreamApi>) -> Self {
        Self { id, api }
    }

    /// Stable numeric identity, parsed from the credential.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The session handle for upstream calls.
    pub fn api(&self) -> &Arc<dyn UpstreamApi> {
        &self.api
    }
}

/// Round-robin pool of workers.
pub struct WorkerPool {
    workers: Vec<Arc<Worker>>,
    cursor: AtomicU64,
}

impl WorkerPool {
    /// Opens one session per credential and spawns its keep-alive task.
    ///
    /// A credential without a parseable id, or whose session cannot be
    /// opened at all, is skipped with an error log. Workers whose
    /// background sign-in later fails remain in the pool.
    pub async fn connect(
        credentials: &[BotCredential],
        connector: &dyn UpstreamConnector,
        shutdown: CancellationToken,
    ) -> Self {
        let mut workers = Vec::with_capacity(credentials.len());
        for credential in credentials {
            let id = match credential.worker_id() {
                Ok(id) => id,
                Err(err) => {
                    error!(token = credential.short(), %err, "skipping credential");
                    continue;
                }
            };
            let api = match connector.open_session(credential).await {
                Ok(api) => api,
                Err(err) => {
                    error!(worker = id, %err, "failed to open upstream session");
                    continue;
                }
            };
            tokio::spawn(authorize_in_background(
                Arc::clone(&api),
                credential.clone(),
                shutdown.clone(),
            ));
            workers.push(Arc::new(Worker::new(id, api)));
        }
        Self {
            workers,
            cursor: AtomicU64::new(0),
        }
    }

    /// Atomic round-robin selection; `None` iff the pool is empty.
    pub fn next(&self) -> Option<Arc<Worker>> {
        if self.workers.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % self.workers.len();
        Some(Arc::clone(&self.workers[index]))
    }

    /// Stable ordered enumeration for bootstrap tasks.
    pub fn all(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Number of workers in the pool.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool holds no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Runs the login handshake for one session, then parks until shutdown.
async fn authorize_in_background(
    api: Arc<dyn UpstreamApi>,
    credential: BotCredential,
    shutdown: CancellationToken,
) {
    match api.auth_status().await {
        Ok(true) => info!(token = credential.short(), "session already authorized"),
        Ok(false) => match api.sign_in_bot(credential.token()).await {
            Ok(()) => info!(token = credential.short(), "bot sign-in complete"),
            Err(err) => error!(token = credential.short(), %err, "bot sign-in failed"),
        },
        Err(err) => error!(token = credential.short(), %err, "auth status check failed"),
    }
    shutdown.cancelled().await;
}
