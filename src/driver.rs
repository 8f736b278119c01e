use std::sync::Arc;

use http::StatusCode;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use n0_future::{boxed::BoxFuture, FuturesUnordered, StreamExt};
use web_transport_proto::{Frame, StreamUni, VarInt};

use crate::{
    connect::{respond_plain, Connect, Request},
    registry::{ConnectionId, Registry},
    CloseReason, ConnectError, ControlStreams, Event, Observer, RequestGate, Session,
    SessionError, SessionId, SessionState, WebTransportError,
};

/// What every connection of an endpoint shares.
#[derive(Clone)]
pub(crate) struct Context {
    pub(crate) registry: Arc<Registry>,
    pub(crate) observer: Arc<dyn Observer>,
    // Only servers answer requests.
    pub(crate) gate: Option<Arc<dyn RequestGate>>,
}

impl Context {
    pub(crate) fn new(observer: Arc<dyn Observer>, gate: Option<Arc<dyn RequestGate>>) -> Self {
        Self {
            registry: Default::default(),
            observer,
            gate,
        }
    }
}

/// A stream whose header has been read.
enum Inbound {
    Bi {
        session: SessionId,
        send: SendStream,
        recv: RecvStream,
    },
    Uni {
        session: SessionId,
        recv: RecvStream,
    },
    Qpack(RecvStream),
    Handled,
}

/// Accepts every stream of one connection and hands it to the session it belongs to.
///
/// Stream headers are decoded concurrently, so a peer that stalls on one stream
/// doesn't hold up the others.
pub(crate) struct Driver {
    conn: Connection,
    id: ConnectionId,
    // Closing a control stream is a connection error, so keep them until the connection is gone.
    _control: ControlStreams,
    ctx: Context,
}

impl Driver {
    pub(crate) fn new(conn: Connection, control: ControlStreams, ctx: Context) -> Self {
        Self {
            id: ConnectionId::of(&conn),
            conn,
            _control: control,
            ctx,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) async fn run(self) {
        let mut pending: FuturesUnordered<BoxFuture<Result<Inbound, SessionError>>> =
            FuturesUnordered::new();

        // The peer may (incorrectly) open QPACK streams, which must stay open.
        let mut qpack = Vec::new();

        let err = loop {
            tokio::select! {
                res = self.conn.accept_bi() => match res {
                    Ok((send, recv)) => pending.push(Box::pin(decode_bi(
                        self.conn.clone(),
                        self.id,
                        self.ctx.clone(),
                        send,
                        recv,
                    ))),
                    Err(err) => break err,
                },
                res = self.conn.accept_uni() => match res {
                    Ok(recv) => pending.push(Box::pin(decode_uni(recv))),
                    Err(err) => break err,
                },
                Some(res) = pending.next() => match res {
                    Ok(Inbound::Bi { session, send, recv }) => match self.ctx.registry.session(self.id, session) {
                        Some(session) => session.deliver_bi(send, recv),
                        None => tracing::warn!("dropping bidirectional stream for unknown session {session}"),
                    },
                    Ok(Inbound::Uni { session, recv }) => match self.ctx.registry.session(self.id, session) {
                        Some(session) => session.deliver_uni(recv),
                        None => tracing::warn!("dropping unidirectional stream for unknown session {session}"),
                    },
                    Ok(Inbound::Qpack(recv)) => qpack.push(recv),
                    Ok(Inbound::Handled) => {}
                    Err(err) => {
                        // Ignore the error, the stream was probably reset early.
                        tracing::warn!("failed to decode stream: {err}");
                    }
                },
            }
        };

        tracing::debug!("connection {} closed: {err}", self.id);

        let reason = CloseReason::from(&err);
        for session in self.ctx.registry.remove_connection(self.id) {
            session.terminate(reason.clone());
        }
    }
}

// Reads the stream header, routing WebTransport streams and handling anything else as a request.
async fn decode_bi(
    conn: Connection,
    id: ConnectionId,
    ctx: Context,
    send: SendStream,
    mut recv: RecvStream,
) -> Result<Inbound, SessionError> {
    let typ = VarInt::read(&mut recv)
        .await
        .map_err(|_| WebTransportError::UnknownSession)?;

    if Frame(typ) != Frame::WEBTRANSPORT {
        if let Err(err) = ctx.handle_request(&conn, id, send, recv, typ).await {
            tracing::warn!("failed to handle request: {err}");
        }
        return Ok(Inbound::Handled);
    }

    let session = VarInt::read(&mut recv)
        .await
        .map_err(|_| WebTransportError::UnknownSession)?;

    Ok(Inbound::Bi {
        session: session.into(),
        send,
        recv,
    })
}

async fn decode_uni(mut recv: RecvStream) -> Result<Inbound, SessionError> {
    let typ = VarInt::read(&mut recv)
        .await
        .map_err(|_| WebTransportError::UnknownSession)?;

    match StreamUni(typ) {
        StreamUni::WEBTRANSPORT => {
            let session = VarInt::read(&mut recv)
                .await
                .map_err(|_| WebTransportError::UnknownSession)?;
            Ok(Inbound::Uni {
                session: session.into(),
                recv,
            })
        }
        StreamUni::QPACK_ENCODER | StreamUni::QPACK_DECODER => Ok(Inbound::Qpack(recv)),
        typ => {
            tracing::debug!("ignoring unknown unidirectional stream: {typ:?}");
            Ok(Inbound::Handled)
        }
    }
}

impl Context {
    async fn handle_request(
        &self,
        conn: &Connection,
        id: ConnectionId,
        send: SendStream,
        recv: RecvStream,
        typ: VarInt,
    ) -> Result<(), ConnectError> {
        let Some(gate) = &self.gate else {
            tracing::debug!("ignoring request stream from server");
            return Ok(());
        };

        match Connect::accept(send, recv, typ).await? {
            Request::Plain(request, send) => {
                let status = gate.status(&request);
                respond_plain(send, status).await?;

                if status != StatusCode::OK {
                    let method = request.method().map_or("<none>", |method| method.as_str());
                    self.observer.on_event(&Event::RequestRejected {
                        request: format!("{method} request"),
                        status,
                    });
                }
                Ok(())
            }
            Request::Connect(connect) => self.open_session(conn, id, connect).await,
        }
    }

    async fn open_session(
        &self,
        conn: &Connection,
        id: ConnectionId,
        mut connect: Connect,
    ) -> Result<(), ConnectError> {
        let url = connect.url().clone();

        let Some(on_open) = self.registry.handler(url.path()) else {
            connect.reject(StatusCode::NOT_FOUND).await?;
            self.observer.on_event(&Event::RequestRejected {
                request: format!("CONNECT {url}"),
                status: StatusCode::NOT_FOUND,
            });
            return Ok(());
        };

        let session = match Session::new(
            conn.clone(),
            connect.session_id(),
            url.clone(),
            SessionState::Open,
            self.observer.clone(),
        ) {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!("refusing session: {err}");
                return connect.reject(StatusCode::BAD_REQUEST).await;
            }
        };

        // Handlers must be in place before the peer learns the session exists.
        on_open(&session);
        self.registry.insert(id, &session);

        if let Err(err) = connect.respond(StatusCode::OK).await {
            session.abandon(CloseReason::new(0, "failed to accept session"));
            return Err(err);
        }

        self.observer.on_event(&Event::SessionOpened {
            session: session.id(),
            url,
        });

        tokio::spawn(connect.run(session));
        Ok(())
    }
}
