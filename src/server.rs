use std::{net::SocketAddr, sync::Arc, time::Duration};

use iroh::{endpoint, Endpoint, EndpointAddr, EndpointId, SecretKey};
use n0_future::{boxed::BoxFuture, FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    driver::{Context, Driver},
    session::close_all,
    ControlStreams, MethodGate, Observer, RequestGate, ServerError, Session, TracingObserver,
    ALPN_H3, DEFAULT_SHUTDOWN_TIMEOUT,
};

/// How long a connecting peer may take for the QUIC and SETTINGS handshakes.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Construct a WebTransport [Server] using sane defaults.
///
/// This is optional; advanced users may use [Server::new] directly.
pub struct ServerBuilder {
    builder: endpoint::Builder,
    gate: Arc<dyn RequestGate>,
    observer: Arc<dyn Observer>,
    handshake_timeout: Duration,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    /// Create a server builder with sane defaults.
    pub fn new() -> Self {
        Self {
            builder: Endpoint::builder(),
            gate: Arc::new(MethodGate),
            observer: Arc::new(TracingObserver),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Listen on the specified address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.builder = match addr {
            SocketAddr::V4(addr) => self.builder.bind_addr_v4(addr),
            SocketAddr::V6(addr) => self.builder.bind_addr_v6(addr),
        };
        self
    }

    /// Use a fixed identity instead of generating one.
    pub fn with_secret_key(mut self, secret_key: SecretKey) -> Self {
        self.builder = self.builder.secret_key(secret_key);
        self
    }

    /// Answer plain HTTP/3 requests with this gate instead of [`MethodGate`].
    pub fn with_gate(mut self, gate: impl RequestGate) -> Self {
        self.gate = Arc::new(gate);
        self
    }

    /// Report events to this observer instead of [`TracingObserver`].
    pub fn with_observer(mut self, observer: impl Observer) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub async fn build(self) -> Result<Server, ServerError> {
        let endpoint = self
            .builder
            .alpns(vec![ALPN_H3.as_bytes().to_vec()])
            .bind()
            .await
            .map_err(Arc::new)?;

        Ok(Server {
            endpoint,
            ctx: Context::new(self.observer, Some(self.gate)),
            shutdown: CancellationToken::new(),
            handshake_timeout: self.handshake_timeout,
        })
    }
}

/// A WebTransport server that routes sessions by URL path.
///
/// Cheap to clone: routes can be added from one clone while another runs [`Server::run`].
#[derive(Clone)]
pub struct Server {
    endpoint: Endpoint,
    ctx: Context,
    shutdown: CancellationToken,
    handshake_timeout: Duration,
}

impl Server {
    /// Creates a new server with a manually constructed [`Endpoint`].
    ///
    /// The endpoint's ALPNs MUST include [`ALPN_H3`].
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ctx: Context::new(Arc::new(TracingObserver), Some(Arc::new(MethodGate))),
            shutdown: CancellationToken::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn endpoint_id(&self) -> EndpointId {
        self.endpoint.id()
    }

    /// The address clients dial to reach this server.
    pub fn endpoint_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Accept sessions whose CONNECT path is exactly `path`.
    ///
    /// `on_session_open` runs before the client is told the session exists, so it is
    /// the place to install a stream handler or termination listener. Replaces any
    /// handler previously registered for `path`.
    pub fn route<F>(&self, path: &str, on_session_open: F)
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        if self
            .ctx
            .registry
            .route(path, Arc::new(on_session_open))
            .is_some()
        {
            tracing::debug!("replaced handler for {path}");
        }
    }

    /// Stop accepting sessions on `path`. Live sessions are unaffected.
    pub fn unroute(&self, path: &str) -> bool {
        self.ctx.registry.unroute(path)
    }

    /// The sessions currently open on this server.
    pub fn sessions(&self) -> Vec<Session> {
        self.ctx.registry.sessions()
    }

    /// Accept connections until the endpoint or this server is closed.
    ///
    /// Each connection is driven on its own task; a failed handshake is logged and
    /// doesn't stop the loop.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut handshakes: FuturesUnordered<BoxFuture<Result<Driver, ServerError>>> =
            FuturesUnordered::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = self.endpoint.accept() => {
                    let Some(incoming) = res else { break };
                    let ctx = self.ctx.clone();
                    let timeout = self.handshake_timeout;
                    handshakes.push(Box::pin(async move {
                        tokio::time::timeout(timeout, async move {
                            let conn = incoming.await.map_err(Arc::new)?;
                            let control = ControlStreams::exchange(&conn).await?;
                            Ok::<_, ServerError>(Driver::new(conn, control, ctx))
                        })
                        .await
                        .map_err(|_| ServerError::Timeout)?
                    }));
                }
                Some(res) = handshakes.next() => match res {
                    Ok(driver) => {
                        tracing::debug!("accepted connection {}", driver.id());
                        tokio::spawn(driver.run());
                    }
                    Err(err) => tracing::warn!("handshake failed: {err:#}"),
                },
            }
        }

        Ok(())
    }

    /// Terminate every session with code 0, then close the endpoint.
    ///
    /// Waits at most [`DEFAULT_SHUTDOWN_TIMEOUT`] for the sessions' close capsules.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let sessions = self.ctx.registry.drain();
        close_all(sessions, 0, "server closed", DEFAULT_SHUTDOWN_TIMEOUT).await;

        self.endpoint.close().await;
    }
}
