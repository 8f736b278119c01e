use crate::{RecvStream, SendStream, SessionId};

/// A bidirectional WebTransport stream: independent read and write halves sharing one id.
#[derive(Debug)]
pub struct Stream {
    session: SessionId,
    send: SendStream,
    recv: RecvStream,
}

impl Stream {
    pub(crate) fn new(session: SessionId, send: SendStream, recv: RecvStream) -> Self {
        Self {
            session,
            send,
            recv,
        }
    }

    pub fn id(&self) -> u64 {
        self.send.id()
    }

    /// The session this stream belongs to.
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn send(&mut self) -> &mut SendStream {
        &mut self.send
    }

    pub fn recv(&mut self) -> &mut RecvStream {
        &mut self.recv
    }

    /// True once the write side was finished or reset. It can't be reopened.
    pub fn is_write_closed(&self) -> bool {
        self.send.is_finished()
    }

    /// True once the peer's end of stream was read.
    pub fn is_read_closed(&self) -> bool {
        self.recv.is_finished()
    }

    pub fn into_parts(self) -> (SendStream, RecvStream) {
        (self.send, self.recv)
    }
}
