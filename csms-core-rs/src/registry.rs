//! Live connection registry
//!
//! Maps charge point identities to their current [`Session`]. At most one
//! session is registered per identity: registering again replaces the old
//! session and closes it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::session::{CloseReason, Session};

/// Identity -> session map shared by the listener and the control API
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` under its identity.
    ///
    /// A previously registered session for the same identity is closed and
    /// returned.
    pub fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let identity = session.identity().to_string();
        let replaced = self.sessions.write().insert(identity.clone(), session);

        match &replaced {
            Some(old) => {
                info!("{}: new connection replaces the existing one", identity);
                old.close(CloseReason::Replaced);
            }
            None => info!("{}: connected", identity),
        }
        replaced
    }

    /// Remove the session registered under `identity`, closing it.
    ///
    /// Unknown identities are ignored.
    pub fn unregister(&self, identity: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(identity);
        if let Some(session) = &removed {
            session.close(CloseReason::Unregistered);
            info!("{}: unregistered", identity);
        }
        removed
    }

    /// Remove `session` only if it is still the registered one.
    ///
    /// Used by a connection on its way out, so a stale connection never
    /// evicts the session that replaced it.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write();
        let current = match sessions.get(session.identity()) {
            Some(current) => current,
            None => return false,
        };

        if Arc::ptr_eq(current, session) {
            sessions.remove(session.identity());
            drop(sessions);
            info!("{}: disconnected", session.identity());
            true
        } else {
            debug!("{}: stale connection left, keeping its replacement", session.identity());
            false
        }
    }

    pub fn lookup(&self, identity: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(identity).cloned()
    }

    /// Identities with a live session (sorted)
    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.sessions.read().keys().cloned().collect();
        identities.sort();
        identities
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close and remove every session
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close(CloseReason::Shutdown);
        }
        if !drained.is_empty() {
            info!("Closed {} sessions", drained.len());
        }
        drained.len()
    }
}
