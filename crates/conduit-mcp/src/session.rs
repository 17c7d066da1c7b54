use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

/// A server-assigned token identifying one continuous logical connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub server_name: String,
    pub session_id: String,
    /// False for ids minted locally when the server issued none.
    pub issued_by_server: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// What [`SessionRegistry::establish`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionChange {
    /// No session existed for the server.
    Created,
    /// The server accepted the previous token.
    Resumed,
    /// The server issued a new token; the old one is gone.
    Replaced { previous: String },
}

/// Per-server session lifecycle: at most one live session per server name.
///
/// Every mutation happens under one write lock, so replacing a session is
/// atomic: there is never a moment with two live sessions for one server.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, server: &str) -> Option<Session> {
        self.sessions.read().get(server).cloned()
    }

    /// Token to offer the server when reconnecting, if any. Local ids are
    /// never offered.
    pub fn resume_token(&self, server: &str) -> Option<String> {
        self.sessions
            .read()
            .get(server)
            .filter(|s| s.issued_by_server)
            .map(|s| s.session_id.clone())
    }

    pub fn is_active(&self, server: &str) -> bool {
        self.sessions.read().contains_key(server)
    }

    /// Record the session id in force after a successful handshake.
    pub fn establish(
        &self,
        server: &str,
        session_id: &str,
        issued_by_server: bool,
    ) -> SessionChange {
        let now = Utc::now();
        let mut sessions = self.sessions.write();
        match sessions.get_mut(server) {
            Some(existing) if existing.session_id == session_id && issued_by_server => {
                existing.last_activity_at = now;
                debug!(server, "Session resumed");
                SessionChange::Resumed
            }
            Some(existing) => {
                let previous = std::mem::replace(
                    existing,
                    Session {
                        server_name: server.to_string(),
                        session_id: session_id.to_string(),
                        issued_by_server,
                        created_at: now,
                        last_activity_at: now,
                    },
                );
                info!(server, "Session replaced");
                SessionChange::Replaced {
                    previous: previous.session_id,
                }
            }
            None => {
                sessions.insert(
                    server.to_string(),
                    Session {
                        server_name: server.to_string(),
                        session_id: session_id.to_string(),
                        issued_by_server,
                        created_at: now,
                        last_activity_at: now,
                    },
                );
                info!(server, "Session created");
                SessionChange::Created
            }
        }
    }

    /// Bump `last_activity_at` after traffic on the session.
    pub fn touch(&self, server: &str) {
        if let Some(session) = self.sessions.write().get_mut(server) {
            session.last_activity_at = Utc::now();
        }
    }

    /// Forget the session, returning it if one existed.
    pub fn end(&self, server: &str) -> Option<Session> {
        let ended = self.sessions.write().remove(server);
        if ended.is_some() {
            info!(server, "Session ended");
        }
        ended
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
