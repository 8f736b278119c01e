use url::Url;

use crate::SessionId;

/// Something that happened to a session or stream, reported to an [`Observer`].
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    /// A session finished its handshake.
    SessionOpened { session: SessionId, url: Url },

    /// A stream was echoed back and its write side finished.
    StreamEchoed {
        session: SessionId,
        stream: u64,
        bytes: u64,
    },

    /// Echoing a stream failed; the session keeps running.
    StreamFailed {
        session: SessionId,
        stream: u64,
        error: String,
    },

    /// A request was answered with something other than 200.
    RequestRejected {
        request: String,
        status: http::StatusCode,
    },

    /// A session terminated, locally or by the peer.
    SessionClosed {
        session: SessionId,
        code: u32,
        reason: String,
    },
}

/// Receives [`Event`]s. Implemented for any `Fn(&Event)`.
pub trait Observer: Send + Sync + 'static {
    fn on_event(&self, event: &Event);
}

impl<F> Observer for F
where
    F: Fn(&Event) + Send + Sync + 'static,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// The default [`Observer`], forwarding every event to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: &Event) {
        match event {
            Event::SessionOpened { session, url } => {
                tracing::info!("session {session} opened to {url}")
            }
            Event::StreamEchoed {
                session,
                stream,
                bytes,
            } => tracing::info!("session {session} echoed {bytes} bytes on stream {stream}"),
            Event::StreamFailed {
                session,
                stream,
                error,
            } => tracing::warn!("session {session} failed to echo stream {stream}: {error}"),
            Event::RequestRejected { request, status } => {
                tracing::debug!("rejected {request} with {status}")
            }
            Event::SessionClosed {
                session,
                code,
                reason,
            } => tracing::info!("session {session} closed with error code {code}: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn closures_observe_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let observer: Arc<dyn Observer> = {
            let seen = seen.clone();
            Arc::new(move |event: &Event| seen.lock().push(event.clone()))
        };

        let event = Event::SessionClosed {
            session: SessionId::new(4),
            code: 9,
            reason: "bye".to_owned(),
        };
        observer.on_event(&event);
        TracingObserver.on_event(&event);

        assert_eq!(*seen.lock(), vec![event]);
    }
}
