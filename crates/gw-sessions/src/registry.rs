//! Keyed, TTL-bounded session store with a per-session exclusive lock.
//!
//! Sessions are process-local only; nothing here is persisted across
//! restarts. `created_at`/`last_used_at` are tracked as monotonic
//! instants since they only ever feed elapsed-duration checks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use gw_domain::error::{Error, Result};
use parking_lot::RwLock;
use uuid::Uuid;

/// A single conversational session owned by the registry.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub client_id: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub model: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    Created,
    Resumed,
}

#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub action: ResolveAction,
    pub session_id: Uuid,
}

pub struct SessionRegistry {
    ttl: Duration,
    max_age: Duration,
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl SessionRegistry {
    pub fn new(ttl: Duration, max_age: Duration) -> Self {
        Self {
            ttl,
            max_age,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves an existing session or creates a new one.
    ///
    /// `session_id` absent always creates. When present, it must be a
    /// valid UUID v4 owned by `client_id`, and not past its TTL or max
    /// age -- all three failure modes return an identical "not found"
    /// error so a caller cannot distinguish them.
    pub fn resolve(
        &self,
        session_id: Option<&str>,
        client_id: &str,
        model: &str,
    ) -> Result<ResolveOutcome> {
        let Some(raw_id) = session_id else {
            return Ok(self.create(client_id, model));
        };

        let id = Uuid::parse_str(raw_id).map_err(|_| Error::InvalidSessionId)?;
        if id.get_version_num() != 4 {
            return Err(Error::InvalidSessionId);
        }

        let now = Instant::now();
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.get(&id) else {
            return Err(Error::SessionNotFound);
        };

        if session.client_id != client_id {
            return Err(Error::SessionNotFound);
        }
        if now.duration_since(session.created_at) > self.max_age
            || now.duration_since(session.last_used_at) > self.ttl
        {
            sessions.remove(&id);
            return Err(Error::SessionNotFound);
        }
        if session.is_active {
            return Err(Error::SessionBusy);
        }

        Ok(ResolveOutcome {
            action: ResolveAction::Resumed,
            session_id: id,
        })
    }

    fn create(&self, client_id: &str, model: &str) -> ResolveOutcome {
        let now = Instant::now();
        let id = Uuid::new_v4();
        let session = Session {
            id,
            client_id: client_id.to_owned(),
            created_at: now,
            last_used_at: now,
            model: model.to_owned(),
            is_active: false,
        };
        self.sessions.write().insert(id, session);
        ResolveOutcome {
            action: ResolveAction::Created,
            session_id: id,
        }
    }

    /// Flips `is_active` true, touching `last_used_at`. Fails with
    /// `SessionBusy` if already held.
    pub fn acquire_lock(&self, id: Uuid) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id).ok_or(Error::SessionNotFound)?;
        if session.is_active {
            return Err(Error::SessionBusy);
        }
        session.is_active = true;
        session.last_used_at = Instant::now();
        Ok(())
    }

    /// Clears `is_active`, touching `last_used_at`. A no-op if the
    /// session has already been swept away.
    pub fn release_lock(&self, id: Uuid) {
        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get_mut(&id) {
            session.is_active = false;
            session.last_used_at = Instant::now();
        }
    }

    /// Removes every session that is idle (not locked) and past either
    /// TTL or max age. Active sessions are skipped regardless of age.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| {
            if session.is_active {
                return true;
            }
            now.duration_since(session.created_at) <= self.max_age
                && now.duration_since(session.last_used_at) <= self.ttl
        });
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "session sweep");
        }
    }

    /// Clears all tracked state. Does not stop a sweep timer -- that is
    /// the caller's responsibility (see [`spawn_sweeper`](super::sweeper::spawn_sweeper)).
    pub fn destroy(&self) {
        self.sessions.write().clear();
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}
