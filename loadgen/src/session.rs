//! Client sessions shared by all requests of a run.
//!
//! A session wraps an HTTP client with its connection pool and caps the number of requests
//! that may be on the wire at the same time. Requests beyond the cap queue for a connection
//! slot, the same way they would queue for a socket in a bounded connection pool.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{Error, Result};

const USER_AGENT: &str = concat!("loadgen/", env!("CARGO_PKG_VERSION"));

/// Which execution model carries the requests of a run.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Cooperative tasks on the tokio runtime sharing an async client.
    #[default]
    Async,
    /// One OS thread per request sharing a blocking client.
    Threaded,
}

/// Settings for opening a [`ClientSession`].
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Maximum number of requests on the wire at once.
    pub max_connections: usize,
    /// Timeout applied to each request as a whole.
    pub timeout: Option<Duration>,
}

/// An open HTTP client reused by every request of one run.
///
/// The session is closed exactly once: explicitly through [`close`](Self::close), or when it is
/// dropped on an error path.
#[derive(Debug)]
pub enum ClientSession {
    /// Session for the [`BackendKind::Async`] backend.
    Async(AsyncSession),
    /// Session for the [`BackendKind::Threaded`] backend.
    Blocking(BlockingSession),
}

impl ClientSession {
    /// Opens a session for the given backend.
    pub async fn open(kind: BackendKind, config: &SessionConfig) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(Error::InvalidConfig(
                "connection limit must be positive".to_owned(),
            ));
        }

        let session = match kind {
            BackendKind::Async => Self::Async(AsyncSession::open(config)?),
            BackendKind::Threaded => Self::Blocking(BlockingSession::open(config).await?),
        };

        tracing::debug!(
            backend = ?kind,
            max_connections = config.max_connections,
            "opened client session"
        );
        Ok(session)
    }

    /// Releases the session and its connection pool.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        tracing::debug!("closed client session");
    }
}

/// Session backed by an async [`reqwest::Client`].
///
/// Cloning is cheap and shares the connection pool.
#[derive(Clone, Debug)]
pub struct AsyncSession {
    client: reqwest::Client,
    connections: Arc<Semaphore>,
}

impl AsyncSession {
    fn open(config: &SessionConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_connections)
            .user_agent(USER_AGENT);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            connections: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Waits for a free connection slot.
    pub(crate) async fn connection(&self) -> Result<SemaphorePermit<'_>> {
        self.connections
            .acquire()
            .await
            .map_err(|_| Error::InvalidState("connection pool closed"))
    }
}

/// Session backed by a [`reqwest::blocking::Client`].
///
/// The blocking client runs its own internal runtime and must neither be created nor dropped
/// from within async code. It is therefore built on the blocking thread pool and released on a
/// plain thread.
#[derive(Clone, Debug)]
pub struct BlockingSession {
    inner: Arc<BlockingInner>,
}

#[derive(Debug)]
struct BlockingInner {
    client: Option<reqwest::blocking::Client>,
    connections: Semaphore,
}

impl BlockingSession {
    async fn open(config: &SessionConfig) -> Result<Self> {
        let max_connections = config.max_connections;
        let timeout = config.timeout;

        let client = tokio::task::spawn_blocking(move || {
            reqwest::blocking::Client::builder()
                .pool_max_idle_per_host(max_connections)
                .user_agent(USER_AGENT)
                .timeout(timeout)
                .build()
        })
        .await??;

        Ok(Self {
            inner: Arc::new(BlockingInner {
                client: Some(client),
                connections: Semaphore::new(max_connections),
            }),
        })
    }

    pub(crate) fn client(&self) -> Result<&reqwest::blocking::Client> {
        self.inner
            .client
            .as_ref()
            .ok_or(Error::InvalidState("blocking client already released"))
    }

    /// Blocks the calling thread until a connection slot is free.
    pub(crate) fn connection(&self) -> Result<SemaphorePermit<'_>> {
        futures::executor::block_on(self.inner.connections.acquire())
            .map_err(|_| Error::InvalidState("connection pool closed"))
    }
}

impl Drop for BlockingInner {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            std::thread::spawn(move || drop(client));
        }
    }
}
