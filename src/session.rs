use std::{collections::VecDeque, fmt, future::Future, sync::Arc, time::Duration};

use iroh::endpoint::Connection;
use n0_future::{boxed::BoxFuture, FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};
use url::Url;

use crate::{
    state::{Lifecycle, TerminationListener},
    CloseReason, Event, Observer, RecvStream, SendStream, SessionError, SessionState, Stream,
    WebTransportError,
};

use web_transport_proto::{Frame, StreamUni, VarInt};

/// Identifies a session within its connection: the QUIC stream id of the CONNECT request.
///
/// Stream ids are never reused, so neither are session ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) const fn new(id: u64) -> Self {
        Self(id)
    }

    pub(crate) fn of(connect: &iroh::endpoint::SendStream) -> Self {
        Self(iroh::endpoint::VarInt::from(connect.id()).into_inner())
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }

    fn to_varint(self) -> Result<VarInt, WebTransportError> {
        VarInt::try_from(self.0).map_err(|_| WebTransportError::InvalidSessionId)
    }
}

impl From<VarInt> for SessionId {
    fn from(id: VarInt) -> Self {
        Self(id.into_inner())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub(crate) type StreamHandler = Arc<dyn Fn(Stream) -> BoxFuture<()> + Send + Sync>;

pub(crate) fn stream_handler<F, Fut>(handler: F) -> StreamHandler
where
    F: Fn(Stream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stream| Box::pin(handler(stream)))
}

/// A WebTransport session: one URL path on one connection, carrying any number of streams.
///
/// Cheap to clone; every clone refers to the same session.
///
/// Incoming bidirectional streams are handed to the handler installed with
/// [`Session::set_stream_handler`], each on its own task. Without a handler they queue
/// up for [`Session::accept_bi`].
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

struct Shared {
    id: SessionId,
    url: Url,
    conn: Connection,
    lifecycle: Arc<Lifecycle>,
    observer: Arc<dyn Observer>,

    // Cache the headers in front of each stream we open.
    header_bi: Vec<u8>,
    header_uni: Vec<u8>,

    incoming: Mutex<Incoming>,
    arrived: Notify,

    // Cancelled once the close capsule was sent, or there's nothing left to send it on.
    flushed: CancellationToken,
}

#[derive(Default)]
struct Incoming {
    handler: Option<StreamHandler>,
    bi: VecDeque<Stream>,
    uni: VecDeque<RecvStream>,
}

impl Session {
    pub(crate) fn new(
        conn: Connection,
        id: SessionId,
        url: Url,
        state: SessionState,
        observer: Arc<dyn Observer>,
    ) -> Result<Self, WebTransportError> {
        let varint = id.to_varint()?;

        let mut header_bi = Vec::new();
        Frame::WEBTRANSPORT.encode(&mut header_bi);
        varint.encode(&mut header_bi);

        let mut header_uni = Vec::new();
        StreamUni::WEBTRANSPORT.encode(&mut header_uni);
        varint.encode(&mut header_uni);

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                url,
                conn,
                lifecycle: Arc::new(Lifecycle::new(state)),
                observer,
                header_bi,
                header_uni,
                incoming: Mutex::default(),
                arrived: Notify::new(),
                flushed: CancellationToken::new(),
            }),
        })
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// The URL of the CONNECT request.
    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub fn state(&self) -> SessionState {
        self.shared.lifecycle.state()
    }

    /// The underlying connection, possibly shared with other sessions.
    pub fn conn(&self) -> &Connection {
        &self.shared.conn
    }

    pub fn observer(&self) -> Arc<dyn Observer> {
        self.shared.observer.clone()
    }

    /// Register a callback invoked exactly once with the error code and reason when the session terminates.
    ///
    /// If the session already terminated, the callback runs immediately.
    pub fn on_terminated<F>(&self, listener: F)
    where
        F: FnOnce(u32, &str) + Send + 'static,
    {
        self.shared.lifecycle.on_terminated(Box::new(listener));
    }

    pub(crate) fn on_terminated_boxed(&self, listener: TerminationListener) {
        self.shared.lifecycle.on_terminated(listener);
    }

    /// Set the handler invoked for every incoming bidirectional stream, replacing any previous one.
    ///
    /// Streams already queued for [`Session::accept_bi`] are handed to the new handler.
    pub fn set_stream_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.install_handler(stream_handler(handler));
    }

    pub(crate) fn install_handler(&self, handler: StreamHandler) {
        let queued = {
            let mut incoming = self.shared.incoming.lock();
            incoming.handler = Some(handler.clone());
            std::mem::take(&mut incoming.bi)
        };

        for stream in queued {
            tokio::spawn(handler(stream));
        }
    }

    pub(crate) fn deliver_bi(
        &self,
        send: iroh::endpoint::SendStream,
        recv: iroh::endpoint::RecvStream,
    ) {
        let lifecycle = &self.shared.lifecycle;
        if lifecycle.token().is_cancelled() {
            return;
        }

        let stream = Stream::new(
            self.id(),
            SendStream::new(send, lifecycle.clone()),
            RecvStream::new(recv, lifecycle.clone()),
        );

        let mut incoming = self.shared.incoming.lock();
        // Termination cancels the token before draining the queue under this lock.
        if lifecycle.token().is_cancelled() {
            return;
        }
        let handler = incoming.handler.clone();
        match handler {
            Some(handler) => {
                drop(incoming);
                tokio::spawn(handler(stream));
            }
            None => {
                incoming.bi.push_back(stream);
                drop(incoming);
                self.shared.arrived.notify_waiters();
            }
        }
    }

    pub(crate) fn deliver_uni(&self, recv: iroh::endpoint::RecvStream) {
        let lifecycle = &self.shared.lifecycle;
        if lifecycle.token().is_cancelled() {
            return;
        }

        let recv = RecvStream::new(recv, lifecycle.clone());
        let mut incoming = self.shared.incoming.lock();
        if lifecycle.token().is_cancelled() {
            return;
        }
        incoming.uni.push_back(recv);
        drop(incoming);
        self.shared.arrived.notify_waiters();
    }

    /// Accept a new bidirectional stream. Only returns streams if no stream handler is set.
    pub async fn accept_bi(&self) -> Result<Stream, SessionError> {
        loop {
            let arrived = self.shared.arrived.notified();

            if let Some(stream) = self.shared.incoming.lock().bi.pop_front() {
                return Ok(stream);
            }

            self.wait(arrived).await?;
        }
    }

    /// Accept a new unidirectional stream.
    pub async fn accept_uni(&self) -> Result<RecvStream, SessionError> {
        loop {
            let arrived = self.shared.arrived.notified();

            if let Some(recv) = self.shared.incoming.lock().uni.pop_front() {
                return Ok(recv);
            }

            self.wait(arrived).await?;
        }
    }

    async fn wait(&self, arrived: tokio::sync::futures::Notified<'_>) -> Result<(), SessionError> {
        let lifecycle = &self.shared.lifecycle;
        if lifecycle.token().is_cancelled() {
            return Err(lifecycle.terminated_error());
        }

        tokio::select! {
            _ = arrived => Ok(()),
            _ = lifecycle.token().cancelled() => Err(lifecycle.terminated_error()),
        }
    }

    /// Open a new bidirectional stream. See [`iroh::endpoint::Connection::open_bi`].
    pub async fn open_bi(&self) -> Result<Stream, SessionError> {
        let lifecycle = &self.shared.lifecycle;
        if lifecycle.token().is_cancelled() {
            return Err(lifecycle.terminated_error());
        }

        let (mut send, recv) = tokio::select! {
            res = self.shared.conn.open_bi() => res?,
            _ = lifecycle.token().cancelled() => return Err(lifecycle.terminated_error()),
        };

        write_header(&mut send, &self.shared.header_bi).await?;

        Ok(Stream::new(
            self.id(),
            SendStream::new(send, lifecycle.clone()),
            RecvStream::new(recv, lifecycle.clone()),
        ))
    }

    /// Open a new unidirectional stream. See [`iroh::endpoint::Connection::open_uni`].
    pub async fn open_uni(&self) -> Result<SendStream, SessionError> {
        let lifecycle = &self.shared.lifecycle;
        if lifecycle.token().is_cancelled() {
            return Err(lifecycle.terminated_error());
        }

        let mut send = tokio::select! {
            res = self.shared.conn.open_uni() => res?,
            _ = lifecycle.token().cancelled() => return Err(lifecycle.terminated_error()),
        };

        write_header(&mut send, &self.shared.header_uni).await?;

        Ok(SendStream::new(send, lifecycle.clone()))
    }

    /// Close the session with an error code and reason.
    ///
    /// Pending stream reads and writes fail immediately; the peer is told with a
    /// CLOSE_WEBTRANSPORT_SESSION capsule. Other sessions on the connection are unaffected.
    pub fn close(&self, code: u32, reason: &str) {
        self.terminate(CloseReason::new(code, reason));
    }

    /// Close the session and wait until the close capsule was handed to the transport.
    pub async fn shutdown(&self, code: u32, reason: &str) {
        self.close(code, reason);
        self.shared.flushed.cancelled().await;
    }

    /// Wait until the session is terminated, returning the reason.
    pub async fn closed(&self) -> SessionError {
        let lifecycle = &self.shared.lifecycle;
        lifecycle.token().cancelled().await;
        lifecycle.terminated_error()
    }

    /// Return why the session was closed, or None if it's not closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.lifecycle.reason()
    }

    pub(crate) fn terminated(&self) -> WaitForCancellationFuture<'_> {
        self.shared.lifecycle.token().cancelled()
    }

    pub(crate) fn flushed_guard(&self) -> DropGuard {
        self.shared.flushed.clone().drop_guard()
    }

    pub(crate) fn mark_open(&self) -> bool {
        self.shared.lifecycle.open()
    }

    /// Terminates the session, dropping any streams nobody accepted yet.
    pub(crate) fn terminate(&self, reason: CloseReason) -> bool {
        if !self.shared.lifecycle.terminate(reason.clone()) {
            return false;
        }

        let queued = std::mem::take(&mut *self.shared.incoming.lock());
        drop(queued);

        self.shared.observer.on_event(&Event::SessionClosed {
            session: self.id(),
            code: reason.code,
            reason: reason.reason,
        });

        true
    }

    /// Marks the close as flushed for sessions that never got a CONNECT stream task.
    pub(crate) fn abandon(&self, reason: CloseReason) {
        self.terminate(reason);
        self.shared.flushed.cancel();
    }
}

/// Closes every session, then waits up to `timeout` for their close capsules to be flushed.
///
/// A peer that stopped reading can hold a flush forever; past the timeout the
/// remaining sessions are left to the endpoint close.
pub(crate) async fn close_all(
    sessions: Vec<Session>,
    code: u32,
    reason: &str,
    timeout: Duration,
) {
    for session in &sessions {
        session.close(code, reason);
    }

    let mut flushes: FuturesUnordered<_> = sessions
        .iter()
        .map(|session| session.shutdown(code, reason))
        .collect();
    let flushed = async { while flushes.next().await.is_some() {} };

    if tokio::time::timeout(timeout, flushed).await.is_err() {
        tracing::warn!(
            "{} of {} sessions did not flush their close within {timeout:?}",
            flushes.len(),
            sessions.len()
        );
    }
}

async fn write_header(
    send: &mut iroh::endpoint::SendStream,
    header: &[u8],
) -> Result<(), SessionError> {
    // Set the stream priority to max and then write the stream header.
    // Otherwise the application could write data with lower priority than the header, resulting in queuing.
    send.set_priority(i32::MAX).ok();
    let res = match send.write_all(header).await {
        Ok(_) => Ok(()),
        Err(iroh::endpoint::WriteError::ConnectionLost(err)) => Err(err.into()),
        Err(err) => Err(WebTransportError::WriteError(err).into()),
    };
    // Reset the stream priority back to the default of 0.
    send.set_priority(0).ok();
    res
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("url", &self.shared.url.as_str())
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Session {}
