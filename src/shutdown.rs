use std::time::Duration;

use thiserror::Error;

use crate::{Client, Server, Session};

/// How long each shutdown step may take.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("timed out closing {0}")]
    Timeout(&'static str),
}

/// Releases sessions and endpoints in order: sessions first, then the client, then the server.
///
/// Call [`Shutdown::finish`] with the outcome of the work the resources were used for. A
/// guard dropped without finishing still closes the sessions and closes the endpoints on
/// a background task.
#[must_use = "call finish() to wait for the shutdown"]
pub struct Shutdown {
    sessions: Vec<Session>,
    client: Option<Client>,
    server: Option<Server>,
    timeout: Duration,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            sessions: Vec::new(),
            client: None,
            server: None,
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_server(mut self, server: Server) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Close this session before anything else.
    pub fn track(&mut self, session: &Session) {
        self.sessions.push(session.clone());
    }

    /// Release everything, then return `result`.
    ///
    /// A failed shutdown step is only reported if `result` is `Ok`; otherwise it is logged
    /// and the original error wins.
    pub async fn finish<T, E>(mut self, result: Result<T, E>) -> Result<T, E>
    where
        E: From<ShutdownError>,
    {
        let released = self.release().await;

        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(shutdown)) => {
                tracing::warn!("shutdown failed after error: {shutdown}");
                Err(err)
            }
        }
    }

    async fn release(&mut self) -> Result<(), ShutdownError> {
        let mut res = Ok(());
        let sessions = std::mem::take(&mut self.sessions);

        for session in &sessions {
            session.close(0, "shutdown");
        }
        let flushed = async {
            for session in &sessions {
                session.shutdown(0, "shutdown").await;
            }
        };
        if tokio::time::timeout(self.timeout, flushed).await.is_err() {
            tracing::warn!("timed out closing {} sessions", sessions.len());
            res = Err(ShutdownError::Timeout("sessions"));
        }

        if let Some(client) = self.client.take() {
            if tokio::time::timeout(self.timeout, client.close()).await.is_err() {
                tracing::warn!("timed out closing client");
                res = res.and(Err(ShutdownError::Timeout("client")));
            }
        }

        if let Some(server) = self.server.take() {
            if tokio::time::timeout(self.timeout, server.close()).await.is_err() {
                tracing::warn!("timed out closing server");
                res = res.and(Err(ShutdownError::Timeout("server")));
            }
        }

        res
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        for session in self.sessions.drain(..) {
            session.close(0, "shutdown");
        }

        if self.client.is_none() && self.server.is_none() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no runtime to close endpoints on");
            return;
        };

        let client = self.client.take();
        let server = self.server.take();
        runtime.spawn(async move {
            if let Some(client) = client {
                client.close().await;
            }
            if let Some(server) = server {
                server.close().await;
            }
        });
    }
}
