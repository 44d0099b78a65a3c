//! One simulated participant: a flow checkpoint plus the session services
//! that act on it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use fm_domain::config::Config;
use fm_domain::error::Result;
use fm_protocol::{HoldingIdentity, SessionEvent, SessionPayload};
use fm_sessions::{
    CloseOrchestrator, FlowCheckpoint, FlowStackItem, OrderedChannel, ProtocolSandboxResolver,
    SessionActivation, SessionInfo, SessionLifecycleManager, SessionStatus,
};

pub struct Node {
    checkpoint: FlowCheckpoint,
    manager: Arc<SessionLifecycleManager>,
    activation: SessionActivation,
    close: CloseOrchestrator,
    resolver: Arc<dyn ProtocolSandboxResolver>,
}

impl Node {
    /// A node running `flow` at the bottom of its stack.
    pub fn new(
        identity: HoldingIdentity,
        flow: &str,
        is_initiating_flow: bool,
        bundle_hashes: Vec<String>,
        config: &Config,
        resolver: Arc<dyn ProtocolSandboxResolver>,
    ) -> Self {
        let mut checkpoint = FlowCheckpoint::new(
            format!("{flow}-{}", uuid::Uuid::new_v4()),
            identity,
            bundle_hashes,
        );
        checkpoint
            .flow_stack
            .push(FlowStackItem::new(flow, is_initiating_flow));

        let channel = Arc::new(OrderedChannel::new(config.channel.clone()));
        let manager = Arc::new(SessionLifecycleManager::new(channel, &config.sessions));
        Self {
            checkpoint,
            activation: SessionActivation::new(resolver.clone(), manager.clone()),
            close: CloseOrchestrator::new(manager.clone()),
            manager,
            resolver,
        }
    }

    pub fn identity(&self) -> &HoldingIdentity {
        &self.checkpoint.holding_identity
    }

    pub fn open(
        &mut self,
        infos: &[SessionInfo],
        send_init_immediately: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.activation
            .activate(&mut self.checkpoint, infos, send_init_immediately, now)
    }

    pub fn send(&mut self, session_id: &str, payload: Vec<u8>, now: DateTime<Utc>) -> Result<()> {
        let mut payloads = BTreeMap::new();
        payloads.insert(session_id.to_owned(), payload);
        let states = self.manager.send_data(&self.checkpoint, &payloads, now)?;
        self.checkpoint.put_session_states(states);
        Ok(())
    }

    pub fn close(&mut self, session_ids: &[String], now: DateTime<Utc>) -> Result<()> {
        self.close
            .close_sessions(&mut self.checkpoint, session_ids, now)
    }

    /// Hand an event from the link to the session layer.  An INIT for an
    /// unknown session is accepted against this node's protocol catalog.
    pub fn deliver(&mut self, event: SessionEvent, now: DateTime<Utc>) -> Result<()> {
        let is_new_init = matches!(event.payload, SessionPayload::Init { .. })
            && self.checkpoint.get_session_state(&event.session_id).is_none();
        if is_new_init {
            let catalog = self.resolver.resolve(
                &self.checkpoint.holding_identity,
                &self.checkpoint.bundle_hashes,
            )?;
            let accepted = self
                .manager
                .accept_init(&mut self.checkpoint, &catalog, event, now)?;
            tracing::info!(
                node = %self.checkpoint.holding_identity,
                session_id = %accepted.state.session_id,
                responder = %accepted.responder.flow,
                "responder flow started"
            );
            return Ok(());
        }
        self.manager.record_received(&mut self.checkpoint, event)
    }

    /// Consume every in-order inbound event, oldest first per session.
    pub fn drain(&mut self) -> Result<Vec<(String, SessionPayload)>> {
        let ids = self.session_ids();
        let mut consumed = Vec::new();
        loop {
            let ready = self.manager.received_events(&self.checkpoint, &ids)?;
            if ready.is_empty() {
                return Ok(consumed);
            }
            self.manager
                .acknowledge_received(&mut self.checkpoint, &ready)?;
            consumed.extend(
                ready
                    .into_iter()
                    .map(|(state, event)| (state.session_id, event.payload)),
            );
        }
    }

    pub fn outbox(&mut self, now: DateTime<Utc>) -> Vec<SessionEvent> {
        self.manager.messages_to_send(&mut self.checkpoint, now)
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .checkpoint
            .sessions()
            .iter()
            .map(|s| s.session_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.checkpoint
            .get_session_state(session_id)
            .map(|s| s.status)
    }

    pub fn statuses(&self) -> BTreeMap<String, SessionStatus> {
        self.checkpoint
            .sessions()
            .iter()
            .map(|s| (s.session_id.clone(), s.status))
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.checkpoint.sessions().open_sessions().is_empty()
    }
}
