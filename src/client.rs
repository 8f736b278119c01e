use std::{future::Future, sync::Arc, time::Duration};

use iroh::{endpoint::Connection, Endpoint, EndpointAddr, EndpointId, SecretKey};
use url::Url;

use crate::{
    connect::Connect,
    driver::{Context, Driver},
    registry::ConnectionId,
    session::{close_all, stream_handler, StreamHandler},
    state::TerminationListener,
    ClientError, CloseReason, ControlStreams, Event, Observer, Session, SessionId, SessionState,
    Stream, TracingObserver, ALPN_H3, DEFAULT_SHUTDOWN_TIMEOUT,
};

/// How long connecting and opening a session may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Construct a WebTransport [Client] using sane defaults.
///
/// This is optional; advanced users may use [Client::new] directly.
pub struct ClientBuilder {
    builder: iroh::endpoint::Builder,
    observer: Arc<dyn Observer>,
    connect_timeout: Duration,
}

impl ClientBuilder {
    /// Create a Client builder, which can be used to establish multiple [Session]s.
    pub fn new() -> Self {
        Self {
            builder: Endpoint::builder(),
            observer: Arc::new(TracingObserver),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Use a fixed identity instead of generating one.
    pub fn with_secret_key(mut self, secret_key: SecretKey) -> Self {
        self.builder = self.builder.secret_key(secret_key);
        self
    }

    /// Report events to this observer instead of [`TracingObserver`].
    pub fn with_observer(mut self, observer: impl Observer) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Bound the QUIC handshake, the SETTINGS exchange and each CONNECT handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub async fn build(self) -> Result<Client, ClientError> {
        let endpoint = self
            .builder
            .alpns(vec![ALPN_H3.as_bytes().to_vec()])
            .bind()
            .await
            .map_err(|err| ClientError::Bind(Arc::new(err)))?;

        Ok(Client {
            endpoint,
            ctx: Context::new(self.observer, None),
            connect_timeout: self.connect_timeout,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A client for connecting to a WebTransport server.
#[derive(Clone)]
pub struct Client {
    endpoint: Endpoint,
    ctx: Context,
    connect_timeout: Duration,
}

impl Client {
    /// Manually create a client from an iroh endpoint.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ctx: Context::new(Arc::new(TracingObserver), None),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Connect to the server and exchange HTTP/3 SETTINGS.
    ///
    /// Any number of sessions can then be created on the connection.
    pub async fn connect(
        &self,
        addr: impl Into<EndpointAddr>,
    ) -> Result<ClientConnection, ClientError> {
        let addr = addr.into();

        let (conn, control) = tokio::time::timeout(self.connect_timeout, async {
            let conn = self
                .endpoint
                .connect(addr, ALPN_H3.as_bytes())
                .await
                .map_err(Arc::new)?;
            let control = ControlStreams::exchange(&conn).await?;
            Ok::<_, ClientError>((conn, control))
        })
        .await
        .map_err(|_| ClientError::Timeout)??;

        let driver = Driver::new(conn.clone(), control, self.ctx.clone());
        let id = driver.id();
        tokio::spawn(driver.run());

        Ok(ClientConnection {
            conn,
            id,
            ctx: self.ctx.clone(),
            timeout: self.connect_timeout,
        })
    }

    /// Connect to the endpoint named by the URL's host and prepare a session on a new connection.
    pub async fn create_session(&self, url: Url) -> Result<PendingSession, ClientError> {
        let endpoint_id: EndpointId = url
            .host_str()
            .ok_or(ClientError::InvalidUrl)?
            .parse()
            .map_err(|_| ClientError::InvalidUrl)?;

        let conn = self.connect(endpoint_id).await?;
        Ok(conn.create_session(url))
    }

    /// Close every session, then the endpoint.
    pub async fn close(&self) {
        let sessions = self.ctx.registry.drain();
        close_all(sessions, 0, "client closed", DEFAULT_SHUTDOWN_TIMEOUT).await;

        self.endpoint.close().await;
    }
}

/// An HTTP/3 connection to a server, able to carry multiple sessions.
#[derive(Clone)]
pub struct ClientConnection {
    conn: Connection,
    id: ConnectionId,
    ctx: Context,
    timeout: Duration,
}

impl ClientConnection {
    pub fn remote_id(&self) -> EndpointId {
        self.conn.remote_id()
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Prepare a session for `url`. Nothing is sent until [`PendingSession::open`].
    pub fn create_session(&self, url: Url) -> PendingSession {
        PendingSession {
            conn: self.clone(),
            url,
            handler: None,
            listeners: Vec::new(),
        }
    }

    /// Close the connection, terminating every session on it.
    pub fn close(&self, code: u32, reason: &str) {
        let code = iroh::endpoint::VarInt::from_u64(web_transport_proto::error_to_http3(code))
            .unwrap_or(iroh::endpoint::VarInt::MAX);
        self.conn.close(code, reason.as_bytes());
    }
}

/// A session that hasn't sent its CONNECT request yet.
///
/// Handlers are registered here so they are in place before the session can observe
/// anything: the server may open streams as soon as it accepts.
pub struct PendingSession {
    conn: ClientConnection,
    url: Url,
    handler: Option<StreamHandler>,
    listeners: Vec<TerminationListener>,
}

impl PendingSession {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> SessionState {
        SessionState::Opening
    }

    /// See [`Session::on_terminated`].
    pub fn on_terminated<F>(mut self, listener: F) -> Self
    where
        F: FnOnce(u32, &str) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
        self
    }

    /// See [`Session::set_stream_handler`].
    pub fn on_stream<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handler = Some(stream_handler(handler));
        self
    }

    /// Send the extended CONNECT and wait for the server to accept it.
    ///
    /// A non-200 response fails with [`crate::ConnectError::Rejected`]. Either way the
    /// termination listeners fire if the session doesn't open.
    pub async fn open(self) -> Result<Session, ClientError> {
        let Self {
            conn,
            url,
            handler,
            listeners,
        } = self;
        let ctx = &conn.ctx;

        let (send, recv) = tokio::time::timeout(conn.timeout, conn.conn.open_bi())
            .await
            .map_err(|_| ClientError::Timeout)??;

        let session = Session::new(
            conn.conn.clone(),
            SessionId::of(&send),
            url.clone(),
            SessionState::Opening,
            ctx.observer.clone(),
        )
        .map_err(crate::SessionError::from)?;

        if let Some(handler) = handler {
            session.install_handler(handler);
        }
        for listener in listeners {
            session.on_terminated_boxed(listener);
        }
        ctx.registry.insert(conn.id, &session);

        let connect = match tokio::time::timeout(conn.timeout, Connect::open(send, recv, url.clone()))
            .await
        {
            Ok(Ok(connect)) => connect,
            Ok(Err(err)) => {
                session.abandon(CloseReason::new(0, err.to_string()));
                return Err(err.into());
            }
            Err(_) => {
                session.abandon(CloseReason::new(0, "handshake timed out"));
                return Err(ClientError::Timeout);
            }
        };

        if !session.mark_open() {
            // Terminated while the handshake was in flight, most likely by the connection closing.
            drop(connect);
            let reason = session.close_reason().unwrap_or_default();
            session.abandon(reason);
            return Err(session.closed().await.into());
        }

        ctx.observer.on_event(&Event::SessionOpened {
            session: session.id(),
            url,
        });

        tokio::spawn(connect.run(session.clone()));
        Ok(session)
    }
}
