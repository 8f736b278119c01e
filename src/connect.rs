use iroh::endpoint::{Connection, RecvStream, SendStream};
use tokio::io::AsyncReadExt;
use web_transport_proto::{Capsule, ConnectRequest, ConnectResponse, VarInt};

use thiserror::Error;
use url::Url;

use crate::{CloseReason, PlainRequest, Session, SessionId};

#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    #[error("protocol error: {0}")]
    ProtoError(#[from] web_transport_proto::ConnectError),

    #[error("connection error")]
    ConnectionError(#[from] iroh::endpoint::ConnectionError),

    #[error("read error")]
    ReadError(#[from] iroh::endpoint::ReadError),

    #[error("write error")]
    WriteError(#[from] iroh::endpoint::WriteError),

    #[error("stream closed")]
    ClosedStream(#[from] iroh::endpoint::ClosedStream),

    #[error("rejected with status: {0}")]
    Rejected(http::StatusCode),
}

/// An HTTP/3 request read from a bidirectional stream.
pub(crate) enum Request {
    /// An extended CONNECT asking for a WebTransport session.
    Connect(Connect),

    /// Anything else, answered by the [`crate::RequestGate`].
    Plain(PlainRequest, SendStream),
}

/// The CONNECT stream of a session. Closing it terminates the session.
pub(crate) struct Connect {
    // The request that was sent by the client.
    request: ConnectRequest,

    send: SendStream,
    recv: RecvStream,
}

impl Connect {
    /// Reads a request whose first varint (the frame type) was already consumed while
    /// looking for a WebTransport stream header.
    pub(crate) async fn accept(
        send: SendStream,
        recv: RecvStream,
        typ: VarInt,
    ) -> Result<Request, ConnectError> {
        let mut prefix = Vec::new();
        typ.encode(&mut prefix);

        let mut reader = std::io::Cursor::new(prefix).chain(recv);
        match ConnectRequest::read(&mut reader).await {
            Ok(request) => {
                tracing::debug!("received CONNECT request: {request:?}");
                let (_, recv) = reader.into_inner();
                Ok(Request::Connect(Self {
                    request,
                    send,
                    recv,
                }))
            }
            Err(web_transport_proto::ConnectError::WrongMethod(method)) => {
                tracing::debug!("received plain request: {method:?}");
                Ok(Request::Plain(PlainRequest::new(method), send))
            }
            // A CONNECT without `:protocol` is a tunnel request, not a session upgrade.
            Err(web_transport_proto::ConnectError::WrongProtocol(_)) => {
                tracing::debug!("received CONNECT request without webtransport protocol");
                Ok(Request::Plain(
                    PlainRequest::new(Some(http::Method::CONNECT)),
                    send,
                ))
            }
            Err(web_transport_proto::ConnectError::InvalidMethod) => {
                tracing::debug!("received request with invalid method");
                Ok(Request::Plain(PlainRequest::new(None), send))
            }
            Err(err) => Err(err.into()),
        }
    }

    // Called by the server to send a response to the client.
    pub(crate) async fn respond(&mut self, status: http::StatusCode) -> Result<(), ConnectError> {
        respond(&mut self.send, status).await
    }

    /// Refuses the session, closing the CONNECT stream.
    pub(crate) async fn reject(mut self, status: http::StatusCode) -> Result<(), ConnectError> {
        respond(&mut self.send, status).await?;
        self.send.finish()?;
        Ok(())
    }

    /// Sends the CONNECT request on a freshly opened stream and waits for a 200.
    pub(crate) async fn open(
        mut send: SendStream,
        mut recv: RecvStream,
        url: Url,
    ) -> Result<Self, ConnectError> {
        let request = ConnectRequest { url };

        tracing::debug!("sending CONNECT request: {request:?}");
        request.write(&mut send).await?;

        let response = match ConnectResponse::read(&mut recv).await {
            Ok(response) => response,
            // Decoding refuses any status outside 2xx.
            Err(web_transport_proto::ConnectError::WrongStatus(Some(status))) => {
                return Err(ConnectError::Rejected(status));
            }
            Err(err) => return Err(err.into()),
        };
        tracing::debug!("received CONNECT response: {response:?}");

        if response.status != http::StatusCode::OK {
            return Err(ConnectError::Rejected(response.status));
        }

        Ok(Self {
            request,
            send,
            recv,
        })
    }

    // The session ID is the stream ID of the CONNECT request.
    pub(crate) fn session_id(&self) -> SessionId {
        SessionId::of(&self.send)
    }

    // The URL in the CONNECT request.
    pub(crate) fn url(&self) -> &Url {
        &self.request.url
    }

    /// Watches the CONNECT stream until either side closes the session.
    ///
    /// A local close is announced to the peer with a CLOSE_WEBTRANSPORT_SESSION capsule.
    pub(crate) async fn run(self, session: Session) {
        let Self { mut send, mut recv, .. } = self;

        // Dropped when this task exits, which marks the close capsule as flushed.
        let _flushed = session.flushed_guard();

        let reason = tokio::select! {
            reason = read_close(&mut recv, session.conn()) => reason,
            _ = session.terminated() => {
                let Some(reason) = session.close_reason() else { return };
                if let Err(err) = write_close(&mut send, &reason).await {
                    tracing::debug!("failed to send close capsule: {err}");
                }
                return;
            }
        };

        session.terminate(reason);
    }
}

/// Answers a request that isn't a session upgrade and closes its stream.
pub(crate) async fn respond_plain(
    mut send: SendStream,
    status: http::StatusCode,
) -> Result<(), ConnectError> {
    respond(&mut send, status).await?;
    send.finish()?;
    Ok(())
}

async fn respond(send: &mut SendStream, status: http::StatusCode) -> Result<(), ConnectError> {
    let resp = ConnectResponse { status };

    tracing::debug!("sending response: {resp:?}");
    resp.write(send).await?;

    Ok(())
}

// Keep reading from the CONNECT stream until it's closed.
async fn read_close(recv: &mut RecvStream, conn: &Connection) -> CloseReason {
    loop {
        match Capsule::read(recv).await {
            Ok(Capsule::CloseWebTransportSession { code, reason }) => {
                return CloseReason::new(code, reason);
            }
            Ok(Capsule::Unknown { typ, payload }) => {
                tracing::warn!("unknown capsule: type={typ} size={}", payload.len());
            }
            Err(err) => {
                tracing::debug!("CONNECT stream closed: {err}");
                // The stream usually dies with its connection, whose close reason is more useful.
                return match conn.close_reason() {
                    Some(err) => CloseReason::from(&err),
                    None => CloseReason::new(0, "connect stream closed"),
                };
            }
        }
    }
}

async fn write_close(send: &mut SendStream, reason: &CloseReason) -> Result<(), ConnectError> {
    let capsule = Capsule::CloseWebTransportSession {
        code: reason.code,
        reason: reason.reason.clone(),
    };

    let mut buf = Vec::new();
    capsule.encode(&mut buf);

    tracing::debug!("sending close capsule: {reason}");
    send.write_all(&buf).await?;
    send.finish()?;

    Ok(())
}
