use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use iroh::endpoint::Connection;
use parking_lot::RwLock;

use crate::{Session, SessionId};

/// Identifies a QUIC connection for the lifetime of the endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(usize);

impl ConnectionId {
    pub(crate) fn of(conn: &Connection) -> Self {
        Self(conn.stable_id())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Invoked synchronously for each session accepted on a path, before the 200 is sent.
pub(crate) type OnSessionOpen = Arc<dyn Fn(&Session) + Send + Sync>;

/// Path handlers and live sessions, shared by every connection of an endpoint.
///
/// Reads vastly outnumber writes: each incoming stream looks up its session while
/// sessions come and go once.
#[derive(Default)]
pub(crate) struct Registry {
    routes: RwLock<HashMap<String, OnSessionOpen>>,
    sessions: RwLock<HashMap<ConnectionId, HashMap<SessionId, Session>>>,
}

impl Registry {
    /// Registers the handler for a path, returning the one it replaced.
    pub(crate) fn route(&self, path: &str, handler: OnSessionOpen) -> Option<OnSessionOpen> {
        self.routes.write().insert(path.to_owned(), handler)
    }

    pub(crate) fn unroute(&self, path: &str) -> bool {
        self.routes.write().remove(path).is_some()
    }

    pub(crate) fn handler(&self, path: &str) -> Option<OnSessionOpen> {
        self.routes.read().get(path).cloned()
    }

    /// Tracks a session until it terminates.
    pub(crate) fn insert(self: &Arc<Self>, conn: ConnectionId, session: &Session) {
        self.sessions
            .write()
            .entry(conn)
            .or_default()
            .insert(session.id(), session.clone());

        let registry: Weak<Self> = Arc::downgrade(self);
        let id = session.id();
        session.on_terminated(move |_, _| {
            if let Some(registry) = registry.upgrade() {
                registry.remove(conn, id);
            }
        });
    }

    pub(crate) fn session(&self, conn: ConnectionId, id: SessionId) -> Option<Session> {
        self.sessions.read().get(&conn)?.get(&id).cloned()
    }

    pub(crate) fn remove(&self, conn: ConnectionId, id: SessionId) -> Option<Session> {
        let mut sessions = self.sessions.write();
        let on_conn = sessions.get_mut(&conn)?;
        let session = on_conn.remove(&id);
        if on_conn.is_empty() {
            sessions.remove(&conn);
        }
        session
    }

    /// Forgets every session of a connection, returning them.
    pub(crate) fn remove_connection(&self, conn: ConnectionId) -> Vec<Session> {
        self.sessions
            .write()
            .remove(&conn)
            .map(|sessions| sessions.into_values().collect())
            .unwrap_or_default()
    }

    /// Forgets every session, returning them.
    pub(crate) fn drain(&self) -> Vec<Session> {
        std::mem::take(&mut *self.sessions.write())
            .into_values()
            .flat_map(HashMap::into_values)
            .collect()
    }

    /// A snapshot of the live sessions.
    pub(crate) fn sessions(&self) -> Vec<Session> {
        self.sessions
            .read()
            .values()
            .flat_map(|sessions| sessions.values().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> OnSessionOpen {
        Arc::new(|_: &Session| {})
    }

    #[test]
    fn routes_replace_and_remove() {
        let registry = Registry::default();

        assert!(registry.handler("/echo").is_none());
        assert!(registry.route("/echo", noop()).is_none());
        assert!(registry.handler("/echo").is_some());
        assert!(registry.handler("/other").is_none());

        assert!(registry.route("/echo", noop()).is_some());

        assert!(registry.unroute("/echo"));
        assert!(!registry.unroute("/echo"));
        assert!(registry.handler("/echo").is_none());
    }

    #[test]
    fn empty_registry_has_no_sessions() {
        let registry = Registry::default();
        let conn = ConnectionId(1);

        assert!(registry.session(conn, SessionId::new(0)).is_none());
        assert!(registry.remove(conn, SessionId::new(0)).is_none());
        assert!(registry.remove_connection(conn).is_empty());
        assert!(registry.drain().is_empty());
        assert!(registry.sessions().is_empty());
    }
}
