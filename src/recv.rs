use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncRead;
use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::{state::Lifecycle, ClosedStream, ReadError, SESSION_GONE};

/// A stream that can be used to receive bytes. See [`iroh::endpoint::RecvStream`].
///
/// Reads also wait on the owning session: once the session terminates, a blocked read
/// returns [`crate::SessionError::Terminated`] instead of hanging.
pub struct RecvStream {
    inner: iroh::endpoint::RecvStream,
    session: Arc<Lifecycle>,
    terminated: Pin<Box<WaitForCancellationFutureOwned>>,
    finished: bool,
}

impl RecvStream {
    pub(crate) fn new(inner: iroh::endpoint::RecvStream, session: Arc<Lifecycle>) -> Self {
        let terminated = Box::pin(session.token().clone().cancelled_owned());
        Self {
            inner,
            session,
            terminated,
            finished: false,
        }
    }

    /// The QUIC stream id.
    pub fn id(&self) -> u64 {
        iroh::endpoint::VarInt::from(self.inner.id()).into_inner()
    }

    /// True once the peer's end of stream was read.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Tell the other end to stop sending data with the given error code. See [`iroh::endpoint::RecvStream::stop`].
    /// This is a u32 with WebTransport since it shares the error space with HTTP/3.
    pub fn stop(&mut self, code: u32) -> Result<(), ClosedStream> {
        let code = web_transport_proto::error_to_http3(code);
        let code = iroh::endpoint::VarInt::try_from(code).map_err(|_| ClosedStream)?;
        self.inner.stop(code).map_err(Into::into)
    }

    /// Read some data into the buffer and return the amount read, or None at the end of the stream.
    /// See [`iroh::endpoint::RecvStream::read`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ReadError> {
        let res = tokio::select! {
            biased;
            _ = self.session.token().cancelled() => return Err(self.abort()),
            res = self.inner.read(buf) => res?,
        };

        self.finished |= res.is_none();
        Ok(res)
    }

    /// Read the next chunk of data, or None at the end of the stream.
    /// See [`iroh::endpoint::RecvStream::read_chunk`].
    pub async fn read_chunk(&mut self, max_length: usize) -> Result<Option<Bytes>, ReadError> {
        let chunk = tokio::select! {
            biased;
            _ = self.session.token().cancelled() => return Err(self.abort()),
            res = self.inner.read_chunk(max_length) => res?,
        };

        self.finished |= chunk.is_none();
        Ok(chunk.map(|chunk| chunk.bytes))
    }

    /// Read until the peer finishes the stream.
    pub async fn read_all(&mut self) -> Result<Bytes, ReadError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.read_chunk(usize::MAX).await? {
            buf.extend_from_slice(&chunk);
        }

        Ok(buf.freeze())
    }

    fn abort(&mut self) -> ReadError {
        self.inner.stop(SESSION_GONE).ok();
        self.session.terminated_error().into()
    }
}

impl AsyncRead for RecvStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf,
    ) -> Poll<io::Result<()>> {
        if self.terminated.as_mut().poll(cx).is_ready() {
            let err = self.abort();
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionAborted, err)));
        }

        let filled = buf.filled().len();
        let res = std::task::ready!(Pin::new(&mut self.inner).poll_read(cx, buf));
        if res.is_ok() && buf.filled().len() == filled && buf.remaining() > 0 {
            self.finished = true;
        }

        Poll::Ready(res)
    }
}

impl std::fmt::Debug for RecvStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvStream")
            .field("id", &self.id())
            .field("finished", &self.finished)
            .finish()
    }
}
