use std::fmt;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::SessionError;

/// Where a [`crate::Session`] is in its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// The CONNECT request was sent but no response has arrived yet.
    Opening,
    /// The handshake completed and streams may flow.
    Open,
    /// The session is gone; every stream operation fails.
    Terminated,
}

/// The error code and message a session terminated with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u32,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code={} reason={}", self.code, self.reason)
    }
}

impl From<&iroh::endpoint::ConnectionError> for CloseReason {
    fn from(err: &iroh::endpoint::ConnectionError) -> Self {
        match err {
            iroh::endpoint::ConnectionError::ApplicationClosed(frame) => {
                // Session codes travel in the HTTP/3 error space; anything else is reported as 0.
                let code = error_from_http3(frame.error_code.into_inner()).unwrap_or(0);
                CloseReason::new(code, String::from_utf8_lossy(&frame.reason))
            }
            err => CloseReason::new(0, err.to_string()),
        }
    }
}

/// Recovers a WebTransport error code from the HTTP/3 error space.
///
/// The inverse of [`web_transport_proto::error_to_http3`], which skips every 31st code
/// because it's reserved for GREASE. Returns `None` outside the WebTransport range or
/// for a GREASE code.
pub(crate) fn error_from_http3(code: u64) -> Option<u32> {
    let first = web_transport_proto::error_to_http3(0);
    let last = web_transport_proto::error_to_http3(u32::MAX);
    if !(first..=last).contains(&code) {
        return None;
    }

    let offset = code - first;
    if offset % 0x1f == 0x1e {
        return None;
    }

    u32::try_from(offset - offset / 0x1f).ok()
}

pub(crate) type TerminationListener = Box<dyn FnOnce(u32, &str) + Send>;

/// Tracks the state of one session and fires its termination listeners.
///
/// The mutex guards both the transition to [`SessionState::Terminated`] and listener
/// registration, so a listener either gets queued before the transition or sees the
/// recorded reason and fires immediately. Either way it fires exactly once.
pub(crate) struct Lifecycle {
    inner: Mutex<Inner>,
    terminated: CancellationToken,
}

struct Inner {
    state: SessionState,
    reason: Option<CloseReason>,
    listeners: Vec<TerminationListener>,
}

impl Lifecycle {
    pub(crate) fn new(state: SessionState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                reason: None,
                listeners: Vec::new(),
            }),
            terminated: CancellationToken::new(),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub(crate) fn reason(&self) -> Option<CloseReason> {
        self.inner.lock().reason.clone()
    }

    /// Cancelled once the session terminates.
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.terminated
    }

    /// The error returned by operations attempted after termination.
    pub(crate) fn terminated_error(&self) -> SessionError {
        SessionError::Terminated(self.reason().unwrap_or_default())
    }

    /// Moves an opening session to [`SessionState::Open`]. Returns false if it already terminated.
    pub(crate) fn open(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Terminated => false,
            _ => {
                inner.state = SessionState::Open;
                true
            }
        }
    }

    pub(crate) fn on_terminated(&self, listener: TerminationListener) {
        let mut inner = self.inner.lock();
        let reason = inner.reason.clone();
        match reason {
            Some(reason) => {
                drop(inner);
                listener(reason.code, &reason.reason);
            }
            None => inner.listeners.push(listener),
        }
    }

    /// Terminates the session, returning false if it was already terminated.
    ///
    /// The first reason wins; later calls are no-ops.
    pub(crate) fn terminate(&self, reason: CloseReason) -> bool {
        let listeners = {
            let mut inner = self.inner.lock();
            if inner.state == SessionState::Terminated {
                return false;
            }

            inner.state = SessionState::Terminated;
            inner.reason = Some(reason.clone());
            std::mem::take(&mut inner.listeners)
        };

        self.terminated.cancel();

        // Listeners run without the lock so they may call back into the session.
        for listener in listeners {
            listener(reason.code, &reason.reason);
        }

        true
    }
}
