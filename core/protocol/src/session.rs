//! Registry of paired senders.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use lanvault_common::SessionId;

/// A confirmed pairing.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// Nonce the sender registered with.
    pub nonce: String,
    pub created_at: DateTime<Utc>,
}

/// Sessions minted by confirmed registrations, keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a session for a sender that registered with `nonce`.
    pub fn create(&self, nonce: &str) -> SessionId {
        let id = SessionId::generate();
        self.sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                nonce: nonce.to_string(),
                created_at: Utc::now(),
            },
        );
        debug!(session = %id, "Session created");
        id
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
