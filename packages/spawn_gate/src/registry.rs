use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::device::{Pid, Script, Session};
use crate::error::RegistryError;

/// Stable identity of one attachment.
///
/// A crashed and re-spawned process gets a fresh session, so sessions are
/// never keyed by pid.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// A session the controller currently owns
pub struct LiveSession {
    pub pid: Pid,
    pub session: Box<dyn Session>,
    /// Set once the script has been created
    pub script: Option<Box<dyn Script>>,
    pub attached_at: DateTime<Utc>,
}

/// The set of attached, not-yet-detached sessions.
///
/// Only touched from the reactor's execution context.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, LiveSession>,
    next_id: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a freshly attached session under a new id.
    ///
    /// Ids are never reused within a run.
    pub fn register(&mut self, pid: Pid, session: Box<dyn Session>) -> (SessionId, &LiveSession) {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        let live = self.sessions.entry(id).or_insert(LiveSession {
            pid,
            session,
            script: None,
            attached_at: Utc::now(),
        });
        (id, live)
    }

    pub fn get(&self, id: SessionId) -> Option<&LiveSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut LiveSession> {
        self.sessions.get_mut(&id)
    }

    /// Remove a session whose detachment was observed.
    ///
    /// `pid` is only used to describe the violation when the id is unknown.
    pub fn remove(&mut self, id: SessionId, pid: Pid) -> Result<LiveSession, RegistryError> {
        self.sessions
            .remove(&id)
            .ok_or(RegistryError::NotRegistered { id, pid })
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Pids with a live session, sorted
    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.sessions.values().map(|live| live.pid).collect();
        pids.sort_unstable();
        pids
    }
}
