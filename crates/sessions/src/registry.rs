//! The sessions owned by one flow checkpoint.
//!
//! A registry is never shared between flows.  All access happens on the
//! thread processing that flow's current event, so there is no locking.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::state::{SessionState, SessionStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRegistry {
    sessions: HashMap<String, SessionState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<&SessionState> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Insert or replace the state for its session id.
    pub fn put(&mut self, state: SessionState) {
        self.sessions.insert(state.session_id.clone(), state);
    }

    pub fn put_all(&mut self, states: impl IntoIterator<Item = SessionState>) {
        for state in states {
            self.put(state);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionState> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SessionState> {
        self.sessions.values_mut()
    }

    /// Sessions that have not reached `CLOSED` or `ERROR`.
    pub fn open_sessions(&self) -> Vec<&SessionState> {
        self.iter().filter(|s| !s.status.is_terminal()).collect()
    }

    pub fn count_with_status(&self, status: SessionStatus) -> usize {
        self.iter().filter(|s| s.status == status).count()
    }
}
