use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::io::AsyncWrite;
use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::{state::Lifecycle, ClosedStream, WriteError, SESSION_GONE};

/// A stream that can be used to send bytes. See [`iroh::endpoint::SendStream`].
///
/// Every write also waits on the owning session: once the session terminates, pending and
/// future writes fail with [`crate::SessionError::Terminated`] and the stream is reset.
pub struct SendStream {
    inner: iroh::endpoint::SendStream,
    session: Arc<Lifecycle>,
    terminated: Pin<Box<WaitForCancellationFutureOwned>>,
    finished: bool,
}

impl SendStream {
    pub(crate) fn new(inner: iroh::endpoint::SendStream, session: Arc<Lifecycle>) -> Self {
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

    /// True once [`Self::finish`] or [`Self::reset`] was called.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Write some data to the stream, returning the size written. See [`iroh::endpoint::SendStream::write`].
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, WriteError> {
        self.check_writable()?;

        tokio::select! {
            biased;
            _ = self.session.token().cancelled() => Err(self.abort()),
            res = self.inner.write(buf) => res.map_err(Into::into),
        }
    }

    /// Write the entire buffer to the stream. See [`iroh::endpoint::SendStream::write_all`].
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        self.check_writable()?;

        tokio::select! {
            biased;
            _ = self.session.token().cancelled() => Err(self.abort()),
            res = self.inner.write_all(buf) => res.map_err(Into::into),
        }
    }

    /// Mark the stream as finished, such that no more data can be written. See [`iroh::endpoint::SendStream::finish`].
    pub fn finish(&mut self) -> Result<(), ClosedStream> {
        if self.finished {
            return Err(ClosedStream);
        }

        self.finished = true;
        self.inner.finish().map_err(Into::into)
    }

    /// Abruptly reset the stream with the provided error code. See [`iroh::endpoint::SendStream::reset`].
    /// This is a u32 with WebTransport because we share the error space with HTTP/3.
    pub fn reset(&mut self, code: u32) -> Result<(), ClosedStream> {
        if self.finished {
            return Err(ClosedStream);
        }

        self.finished = true;
        let code = web_transport_proto::error_to_http3(code);
        let code = iroh::endpoint::VarInt::try_from(code).map_err(|_| ClosedStream)?;
        self.inner.reset(code).map_err(Into::into)
    }

    fn check_writable(&self) -> Result<(), WriteError> {
        if self.session.token().is_cancelled() {
            return Err(self.session.terminated_error().into());
        }

        if self.finished {
            return Err(WriteError::ClosedStream);
        }

        Ok(())
    }

    // The session is gone, so tell the peer to stop waiting for data.
    fn abort(&mut self) -> WriteError {
        if !self.finished {
            self.finished = true;
            self.inner.reset(SESSION_GONE).ok();
        }

        self.session.terminated_error().into()
    }

    fn poll_terminated(&mut self, cx: &mut Context<'_>) -> Option<io::Error> {
        if self.terminated.as_mut().poll(cx).is_pending() {
            return None;
        }

        let err = self.abort();
        Some(io::Error::new(io::ErrorKind::ConnectionAborted, err))
    }
}

impl AsyncWrite for SendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(err) = self.poll_terminated(cx) {
            return Poll::Ready(Err(err));
        }

        AsyncWrite::poll_write(Pin::new(&mut self.inner), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(err) = self.poll_terminated(cx) {
            return Poll::Ready(Err(err));
        }

        self.finished = true;
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for SendStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendStream")
            .field("id", &self.id())
            .field("finished", &self.finished)
            .finish()
    }
}
