//! Flow checkpoint: the externally-persisted state of one flow instance.
//!
//! Only the parts the session subsystem reads are modelled here: the
//! holding identity, the deployed bundle hashes, the flow call stack, and
//! the session registry.

use serde::{Deserialize, Serialize};

use fm_protocol::HoldingIdentity;

use crate::registry::SessionRegistry;
use crate::state::SessionState;

/// A session opened by a flow on the stack.  `initiated` flips to `true`
/// once activation has created the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStackSession {
    pub session_id: String,
    #[serde(default)]
    pub initiated: bool,
}

/// One nested flow invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStackItem {
    pub flow_id: String,
    pub is_initiating_flow: bool,
    #[serde(default)]
    pub sessions: Vec<FlowStackSession>,
}

impl FlowStackItem {
    pub fn new(flow_id: impl Into<String>, is_initiating_flow: bool) -> Self {
        Self {
            flow_id: flow_id.into(),
            is_initiating_flow,
            sessions: Vec::new(),
        }
    }

    pub fn is_session_initiated(&self, session_id: &str) -> bool {
        self.sessions
            .iter()
            .any(|s| s.session_id == session_id && s.initiated)
    }

    /// Flag `session_id` as initiated, adding it when not yet tracked.
    pub fn mark_initiated(&mut self, session_id: &str) {
        match self.sessions.iter_mut().find(|s| s.session_id == session_id) {
            Some(entry) => entry.initiated = true,
            None => self.sessions.push(FlowStackSession {
                session_id: session_id.to_owned(),
                initiated: true,
            }),
        }
    }
}

/// The flow call stack, bottom first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStack {
    items: Vec<FlowStackItem>,
}

impl FlowStack {
    pub fn push(&mut self, item: FlowStackItem) {
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Option<FlowStackItem> {
        self.items.pop()
    }

    pub fn peek(&self) -> Option<&FlowStackItem> {
        self.items.last()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Walk from the top of the stack and return the first match.
    pub fn nearest_first(
        &self,
        predicate: impl Fn(&FlowStackItem) -> bool,
    ) -> Option<&FlowStackItem> {
        self.items.iter().rev().find(|item| predicate(item))
    }

    pub fn nearest_first_mut(
        &mut self,
        predicate: impl Fn(&FlowStackItem) -> bool,
    ) -> Option<&mut FlowStackItem> {
        self.items.iter_mut().rev().find(|item| predicate(item))
    }
}

/// The checkpoint of one flow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCheckpoint {
    pub flow_id: String,
    pub holding_identity: HoldingIdentity,
    #[serde(default)]
    pub bundle_hashes: Vec<String>,
    #[serde(default)]
    pub flow_stack: FlowStack,
    #[serde(default)]
    sessions: SessionRegistry,
}

impl FlowCheckpoint {
    pub fn new(
        flow_id: impl Into<String>,
        holding_identity: HoldingIdentity,
        bundle_hashes: Vec<String>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            holding_identity,
            bundle_hashes,
            flow_stack: FlowStack::default(),
            sessions: SessionRegistry::new(),
        }
    }

    pub fn get_session_state(&self, session_id: &str) -> Option<&SessionState> {
        self.sessions.get(session_id)
    }

    pub fn put_session_state(&mut self, state: SessionState) {
        self.sessions.put(state);
    }

    pub fn put_session_states(&mut self, states: impl IntoIterator<Item = SessionState>) {
        self.sessions.put_all(states);
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionRegistry {
        &mut self.sessions
    }
}
