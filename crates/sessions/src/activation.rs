//! Lazy session activation.
//!
//! A flow names the sessions it wants; activation creates their state on
//! first use, optionally sends the INIT right away, and flags the intent on
//! the initiating flow's stack item so repeated calls are a no-op.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use fm_domain::error::{Error, Result};
use fm_domain::trace::TraceEvent;
use fm_protocol::{
    ContextProperties, HoldingIdentity, PROTOCOL_PROPERTY, PROTOCOL_VERSIONS_PROPERTY,
    REQUIRE_CLOSE_PROPERTY,
};

use crate::checkpoint::FlowCheckpoint;
use crate::manager::{SessionInit, SessionLifecycleManager};
use crate::sandbox::ProtocolSandboxResolver;
use crate::state::{SessionRole, SessionState};

/// A session a flow wants to talk over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: String,
    pub counterparty: HoldingIdentity,
    pub require_close: bool,
    pub context_user_properties: ContextProperties,
}

impl SessionInfo {
    pub fn new(session_id: impl Into<String>, counterparty: HoldingIdentity) -> Self {
        Self {
            session_id: session_id.into(),
            counterparty,
            require_close: true,
            context_user_properties: ContextProperties::new(),
        }
    }

    pub fn require_close(mut self, require_close: bool) -> Self {
        self.require_close = require_close;
        self
    }

    pub fn with_user_properties(mut self, properties: ContextProperties) -> Self {
        self.context_user_properties = properties;
        self
    }
}

pub struct SessionActivation {
    resolver: Arc<dyn ProtocolSandboxResolver>,
    manager: Arc<SessionLifecycleManager>,
}

impl SessionActivation {
    pub fn new(
        resolver: Arc<dyn ProtocolSandboxResolver>,
        manager: Arc<SessionLifecycleManager>,
    ) -> Self {
        Self { resolver, manager }
    }

    /// Infos whose session has no state in the checkpoint yet, first
    /// occurrence per session id.
    pub fn not_yet_activated(
        &self,
        checkpoint: &FlowCheckpoint,
        infos: &[SessionInfo],
    ) -> Vec<SessionInfo> {
        let mut seen = HashSet::new();
        infos
            .iter()
            .filter(|info| checkpoint.get_session_state(&info.session_id).is_none())
            .filter(|info| seen.insert(info.session_id.clone()))
            .cloned()
            .collect()
    }

    /// Create every session in `infos` that does not exist yet.
    ///
    /// Sandbox resolution failures are transient; an empty flow stack or a
    /// stack without an initiating flow is fatal.
    pub fn activate(
        &self,
        checkpoint: &mut FlowCheckpoint,
        infos: &[SessionInfo],
        send_init_immediately: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let initiating_item = checkpoint
            .flow_stack
            .nearest_first(|i| i.is_initiating_flow);
        let flagged: Vec<SessionInfo> = match initiating_item {
            Some(item) => infos
                .iter()
                .filter(|info| !item.is_session_initiated(&info.session_id))
                .cloned()
                .collect(),
            None => infos.to_vec(),
        };

        let pending = self.not_yet_activated(checkpoint, &flagged);
        if pending.is_empty() {
            tracing::debug!(flow_id = %checkpoint.flow_id, "sessions already active");
            return Ok(());
        }

        let catalog = self
            .resolver
            .resolve(&checkpoint.holding_identity, &checkpoint.bundle_hashes)?;

        if checkpoint.flow_stack.is_empty() {
            return Err(Error::FlowStack(format!(
                "flow {} has an empty flow stack, sessions need a running flow",
                checkpoint.flow_id
            )));
        }
        let initiating_flow = checkpoint
            .flow_stack
            .nearest_first(|i| i.is_initiating_flow)
            .map(|i| i.flow_id.clone())
            .ok_or_else(|| {
                Error::FlowStack(format!(
                    "flow stack did not contain an initiating flow (flow {})",
                    checkpoint.flow_id
                ))
            })?;

        let (protocol, versions) = catalog.protocols_for_initiator(&initiating_flow)?;
        let versions_json = serde_json::to_string(&versions)?;

        for info in &pending {
            let mut properties = ContextProperties::new();
            properties.insert(PROTOCOL_PROPERTY.into(), protocol.clone());
            properties.insert(PROTOCOL_VERSIONS_PROPERTY.into(), versions_json.clone());
            properties.insert(REQUIRE_CLOSE_PROPERTY.into(), info.require_close.to_string());

            let state = SessionState::new(
                info.session_id.clone(),
                SessionRole::Initiating,
                info.counterparty.clone(),
                info.require_close,
                properties.clone(),
                now,
            )
            .with_user_properties(info.context_user_properties.clone());
            checkpoint.put_session_state(state);

            if send_init_immediately {
                let state = self.manager.send_init(
                    checkpoint,
                    SessionInit {
                        session_id: info.session_id.clone(),
                        counterparty: info.counterparty.clone(),
                        protocol: protocol.clone(),
                        versions: versions.clone(),
                        context_user_properties: info.context_user_properties.clone(),
                        context_platform_properties: properties,
                    },
                    now,
                )?;
                checkpoint.put_session_state(state);
            }
        }

        if let Some(item) = checkpoint.flow_stack.nearest_first_mut(|i| i.is_initiating_flow) {
            for info in &pending {
                item.mark_initiated(&info.session_id);
            }
        }

        tracing::info!(
            flow = %initiating_flow,
            protocol = %protocol,
            sessions = pending.len(),
            init_sent = send_init_immediately,
            "sessions activated"
        );
        TraceEvent::SessionsActivated {
            flow: initiating_flow,
            protocol,
            sessions: pending.len(),
            init_sent: send_init_immediately,
        }
        .emit();
        Ok(())
    }
}
