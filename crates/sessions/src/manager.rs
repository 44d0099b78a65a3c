//! Session lifecycle manager — builds protocol events and routes them
//! through the sequenced channel.
//!
//! Every operation is a synchronous transformation over the checkpoint's
//! session states.  `send_*` returns updated states without persisting them;
//! the caller decides when to put them back into the checkpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use fm_domain::config::SessionsConfig;
use fm_domain::error::{Error, Result};
use fm_protocol::{
    ContextProperties, ExceptionEnvelope, HoldingIdentity, NegotiatedProtocol, ProtocolCatalog,
    SessionEvent, SessionPayload, PROTOCOL_PROPERTY, PROTOCOL_VERSIONS_PROPERTY,
    REQUIRE_CLOSE_PROPERTY,
};

use crate::channel::SequencedChannel;
use crate::checkpoint::FlowCheckpoint;
use crate::state::{SessionRole, SessionState, SessionStatus};

/// Everything needed to open a session with a peer.
#[derive(Debug, Clone)]
pub struct SessionInit {
    pub session_id: String,
    pub counterparty: HoldingIdentity,
    pub protocol: String,
    pub versions: Vec<u32>,
    pub context_user_properties: ContextProperties,
    pub context_platform_properties: ContextProperties,
}

/// Result of accepting a peer's INIT on the responder side.
#[derive(Debug, Clone)]
pub struct AcceptedSession {
    pub state: SessionState,
    pub responder: NegotiatedProtocol,
}

pub struct SessionLifecycleManager {
    channel: Arc<dyn SequencedChannel>,
    initiated_suffix: String,
}

impl SessionLifecycleManager {
    pub fn new(channel: Arc<dyn SequencedChannel>, config: &SessionsConfig) -> Self {
        Self {
            channel,
            initiated_suffix: config.initiated_suffix.clone(),
        }
    }

    pub fn initiated_suffix(&self) -> &str {
        &self.initiated_suffix
    }

    pub fn channel(&self) -> &dyn SequencedChannel {
        self.channel.as_ref()
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Open a session: an INIT with an empty inbound watermark.  A session
    /// already created in the checkpoint without its INIT is reused, anything
    /// else starts from a fresh state built from the INIT.
    pub fn send_init(
        &self,
        checkpoint: &FlowCheckpoint,
        init: SessionInit,
        now: DateTime<Utc>,
    ) -> Result<SessionState> {
        let mut event = SessionEvent::outbound(
            init.session_id,
            now,
            Some(checkpoint.holding_identity.clone()),
            Some(init.counterparty),
            SessionPayload::Init {
                protocol: init.protocol,
                versions: init.versions,
                context_user_properties: init.context_user_properties,
                context_platform_properties: init.context_platform_properties,
                payload: None,
            },
        );
        event.received_sequence_num = 0;
        event.out_of_order_sequence_nums = vec![0];

        let prior = checkpoint
            .get_session_state(&event.session_id)
            .filter(|s| needs_init(s))
            .cloned();
        self.channel.send(&checkpoint.flow_id, prior, event, now)
    }

    pub fn send_data(
        &self,
        checkpoint: &FlowCheckpoint,
        payloads: &BTreeMap<String, Vec<u8>>,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionState>> {
        payloads
            .iter()
            .map(|(session_id, payload)| {
                self.route(
                    checkpoint,
                    session_id,
                    SessionPayload::Data {
                        payload: payload.clone(),
                    },
                    now,
                )
            })
            .collect()
    }

    pub fn send_close(
        &self,
        checkpoint: &FlowCheckpoint,
        session_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionState>> {
        session_ids
            .iter()
            .map(|id| self.route(checkpoint, id, SessionPayload::Close, now))
            .collect()
    }

    pub fn send_error(
        &self,
        checkpoint: &FlowCheckpoint,
        session_ids: &[String],
        exception: &ExceptionEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Vec<SessionState>> {
        session_ids
            .iter()
            .map(|id| {
                self.route(
                    checkpoint,
                    id,
                    SessionPayload::Error {
                        exception: exception.clone(),
                    },
                    now,
                )
            })
            .collect()
    }

    fn route(
        &self,
        checkpoint: &FlowCheckpoint,
        session_id: &str,
        payload: SessionPayload,
        now: DateTime<Utc>,
    ) -> Result<SessionState> {
        let mut state = session(checkpoint, session_id)?.clone();
        let (initiating, initiated) =
            initiating_and_initiated_identity(Some(&state), &checkpoint.holding_identity);

        // Activated without an immediate INIT: it goes out ahead of the
        // first message instead.
        if needs_init(&state) {
            let init = deferred_init(&state, initiating.clone(), initiated.clone(), now)?;
            state = self
                .channel
                .send(&checkpoint.flow_id, Some(state), init, now)?;
        }

        let event = SessionEvent::outbound(session_id, now, initiating, initiated, payload);
        self.channel
            .send(&checkpoint.flow_id, Some(state), event, now)
    }

    /// Drain the events every session wants on the wire right now.
    pub fn messages_to_send(
        &self,
        checkpoint: &mut FlowCheckpoint,
        now: DateTime<Utc>,
    ) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        for state in checkpoint.sessions_mut().iter_mut() {
            out.extend(self.channel.messages_to_send(state, now));
        }
        out
    }

    // ── Inbound ─────────────────────────────────────────────────────

    /// The next in-order event for each session that has one.
    pub fn received_events(
        &self,
        checkpoint: &FlowCheckpoint,
        session_ids: &[String],
    ) -> Result<Vec<(SessionState, SessionEvent)>> {
        let mut ready = Vec::new();
        for id in session_ids {
            let state = session(checkpoint, id)?;
            if let Some(event) = self.channel.next_received(state) {
                ready.push((state.clone(), event));
            }
        }
        Ok(ready)
    }

    pub fn acknowledge_received(
        &self,
        checkpoint: &mut FlowCheckpoint,
        pairs: &[(SessionState, SessionEvent)],
    ) -> Result<()> {
        for (state, event) in pairs {
            let Some(seq) = event.sequence_num else {
                continue;
            };
            let mut current = session(checkpoint, &state.session_id)?.clone();
            self.channel.acknowledge(&mut current, seq);
            checkpoint.put_session_state(current);
        }
        Ok(())
    }

    /// Record an event delivered by the transport for an existing session
    /// and apply the status effect of every event it makes contiguous: the
    /// peer's first in-order reply confirms a `CREATED` session, an in-order
    /// ERROR fails it.  Events still waiting behind a gap have no effect.
    pub fn record_received(
        &self,
        checkpoint: &mut FlowCheckpoint,
        event: SessionEvent,
    ) -> Result<()> {
        let state = session(checkpoint, &event.session_id)?.clone();
        let watermark = state.received.last_processed_sequence_num;
        let mut state = self.channel.receive(state, event);

        let advanced = state.received.last_processed_sequence_num;
        let released: Vec<SessionPayload> = if advanced > watermark {
            state
                .received
                .undelivered
                .range(watermark + 1..=advanced)
                .map(|(_, e)| e.payload.clone())
                .collect()
        } else {
            Vec::new()
        };

        for payload in released {
            if state.status.is_terminal() {
                break;
            }
            match payload {
                SessionPayload::Error { exception } => {
                    tracing::warn!(
                        session_id = %state.session_id,
                        error_type = %exception.error_type,
                        error = %exception.error_message,
                        "peer reported an error"
                    );
                    state.transition_to(SessionStatus::Error)?;
                }
                _ if state.status == SessionStatus::Created
                    && state.role == SessionRole::Initiating =>
                {
                    state.transition_to(SessionStatus::Confirmed)?;
                }
                _ => {}
            }
        }

        checkpoint.put_session_state(state);
        Ok(())
    }

    /// Responder side: accept a peer's INIT, negotiate the protocol version,
    /// and create the initiated session.  `event.session_id` must already be
    /// in this side's form (carrying the initiated suffix).
    pub fn accept_init(
        &self,
        checkpoint: &mut FlowCheckpoint,
        catalog: &ProtocolCatalog,
        event: SessionEvent,
        now: DateTime<Utc>,
    ) -> Result<AcceptedSession> {
        let SessionPayload::Init {
            protocol,
            versions,
            context_user_properties,
            context_platform_properties,
            ..
        } = &event.payload
        else {
            return Err(Error::Protocol(format!(
                "session {} cannot start with a {} event",
                event.session_id,
                event.payload.kind()
            )));
        };

        if SessionRole::of(&event.session_id, &self.initiated_suffix) != SessionRole::Initiated {
            return Err(Error::Protocol(format!(
                "inbound INIT for {} lacks the initiated session suffix",
                event.session_id
            )));
        }

        let responder = catalog.responder_for_protocol(protocol, versions)?;

        if let Some(existing) = checkpoint.get_session_state(&event.session_id) {
            tracing::debug!(session_id = %event.session_id, "INIT redelivered");
            let state = self.channel.receive(existing.clone(), event);
            checkpoint.put_session_state(state.clone());
            return Ok(AcceptedSession { state, responder });
        }

        let counterparty = event.initiating_identity.clone().ok_or_else(|| {
            Error::Protocol(format!(
                "INIT for session {} does not name its initiator",
                event.session_id
            ))
        })?;
        let require_close = context_platform_properties
            .get(REQUIRE_CLOSE_PROPERTY)
            .map_or(true, |v| v == "true");

        let mut properties = context_platform_properties.clone();
        properties.insert(PROTOCOL_PROPERTY.into(), responder.protocol.clone());
        properties.insert(
            PROTOCOL_VERSIONS_PROPERTY.into(),
            serde_json::to_string(&[responder.version])?,
        );

        let mut state = SessionState::new(
            event.session_id.clone(),
            SessionRole::Initiated,
            counterparty,
            require_close,
            properties,
            now,
        )
        .with_user_properties(context_user_properties.clone());
        state.transition_to(SessionStatus::Confirmed)?;
        let session_id = state.session_id.clone();
        let state = self.channel.receive(state, event);

        let (initiating, initiated) =
            initiating_and_initiated_identity(Some(&state), &checkpoint.holding_identity);
        let confirm = SessionEvent::outbound(
            session_id,
            now,
            initiating,
            initiated,
            SessionPayload::Confirm {
                protocol: responder.protocol.clone(),
                version: responder.version,
            },
        );
        let state = self
            .channel
            .send(&checkpoint.flow_id, Some(state), confirm, now)?;

        tracing::info!(
            session_id = %state.session_id,
            responder = %responder.flow,
            version = responder.version,
            "session accepted"
        );

        checkpoint.put_session_state(state.clone());
        Ok(AcceptedSession { state, responder })
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn all_have_status(
        &self,
        checkpoint: &FlowCheckpoint,
        session_ids: &[String],
        status: SessionStatus,
    ) -> Result<bool> {
        for id in session_ids {
            if session(checkpoint, id)?.status != status {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn with_status(
        &self,
        checkpoint: &FlowCheckpoint,
        session_ids: &[String],
        status: SessionStatus,
    ) -> Result<Vec<SessionState>> {
        let mut matching = Vec::new();
        for id in session_ids {
            let state = session(checkpoint, id)?;
            if state.status == status {
                matching.push(state.clone());
            }
        }
        Ok(matching)
    }

    /// Split `session_ids` into (initiating, initiated) by stored role.
    pub fn partition_by_role(
        &self,
        checkpoint: &FlowCheckpoint,
        session_ids: &[String],
    ) -> Result<(Vec<SessionState>, Vec<SessionState>)> {
        let mut initiating = Vec::new();
        let mut initiated = Vec::new();
        for id in session_ids {
            let state = session(checkpoint, id)?.clone();
            match state.role {
                SessionRole::Initiating => initiating.push(state),
                SessionRole::Initiated => initiated.push(state),
            }
        }
        Ok((initiating, initiated))
    }
}

fn needs_init(state: &SessionState) -> bool {
    state.role == SessionRole::Initiating
        && state.status == SessionStatus::Created
        && state.sent.last_sequence_num == 0
}

/// Rebuild the INIT for a session created without one, from the protocol
/// properties recorded at activation.
fn deferred_init(
    state: &SessionState,
    initiating: Option<HoldingIdentity>,
    initiated: Option<HoldingIdentity>,
    now: DateTime<Utc>,
) -> Result<SessionEvent> {
    let protocol = state.properties.get(PROTOCOL_PROPERTY).ok_or_else(|| {
        Error::Protocol(format!(
            "session {} was created without a protocol",
            state.session_id
        ))
    })?;
    let versions: Vec<u32> = match state.properties.get(PROTOCOL_VERSIONS_PROPERTY) {
        Some(raw) => serde_json::from_str(raw)?,
        None => Vec::new(),
    };

    let mut event = SessionEvent::outbound(
        state.session_id.clone(),
        now,
        initiating,
        initiated,
        SessionPayload::Init {
            protocol: protocol.clone(),
            versions,
            context_user_properties: state.user_properties.clone(),
            context_platform_properties: state.properties.clone(),
            payload: None,
        },
    );
    event.out_of_order_sequence_nums = vec![0];
    Ok(event)
}

/// Look up a session that must exist.
pub(crate) fn session<'a>(
    checkpoint: &'a FlowCheckpoint,
    session_id: &str,
) -> Result<&'a SessionState> {
    checkpoint
        .get_session_state(session_id)
        .ok_or_else(|| Error::SessionMissing(session_id.to_owned()))
}

/// `(initiating, initiated)` identities for events on `state`.
///
/// On the initiated side the stored counterparty opened the session; on the
/// initiating side the local identity did.  With no state yet both are
/// unknown.
pub fn initiating_and_initiated_identity(
    state: Option<&SessionState>,
    local: &HoldingIdentity,
) -> (Option<HoldingIdentity>, Option<HoldingIdentity>) {
    match state {
        None => (None, None),
        Some(s) => match s.role {
            SessionRole::Initiated => (Some(s.counterparty.clone()), Some(local.clone())),
            SessionRole::Initiating => (Some(local.clone()), Some(s.counterparty.clone())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fm_domain::config::ChannelConfig;

    use crate::channel::OrderedChannel;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap()
    }

    fn alice() -> HoldingIdentity {
        HoldingIdentity::new("O=Alice, L=London, C=GB", "g")
    }

    fn bob() -> HoldingIdentity {
        HoldingIdentity::new("O=Bob, L=Paris, C=FR", "g")
    }

    fn manager() -> SessionLifecycleManager {
        SessionLifecycleManager::new(
            Arc::new(OrderedChannel::new(ChannelConfig::default())),
            &SessionsConfig::default(),
        )
    }

    fn init(session_id: &str) -> SessionInit {
        let mut platform = ContextProperties::new();
        platform.insert(REQUIRE_CLOSE_PROPERTY.into(), "true".into());
        SessionInit {
            session_id: session_id.into(),
            counterparty: bob(),
            protocol: "chat".into(),
            versions: vec![1, 2],
            context_user_properties: ContextProperties::new(),
            context_platform_properties: platform,
        }
    }

    #[test]
    fn identity_resolution_by_role() {
        let initiated = SessionState::new(
            "s-INITIATED",
            SessionRole::Initiated,
            alice(),
            true,
            ContextProperties::new(),
            t0(),
        );
        assert_eq!(
            initiating_and_initiated_identity(Some(&initiated), &bob()),
            (Some(alice()), Some(bob()))
        );
        assert_eq!(initiating_and_initiated_identity(None, &bob()), (None, None));
    }

    #[test]
    fn init_carries_empty_watermark() {
        let checkpoint = FlowCheckpoint::new("flow-1", alice(), vec![]);
        let state = manager().send_init(&checkpoint, init("s1"), t0()).unwrap();
        let sent = &state.sent.undelivered[0];
        assert_eq!(sent.received_sequence_num, 0);
        assert_eq!(sent.out_of_order_sequence_nums, vec![0]);
        assert_eq!(sent.initiating_identity, Some(alice()));
        assert_eq!(sent.initiated_identity, Some(bob()));
        assert_eq!(state.status, SessionStatus::Created);
    }

    #[test]
    fn init_reuses_a_session_created_without_one() {
        let mgr = manager();
        let mut checkpoint = FlowCheckpoint::new("flow-1", alice(), vec![]);
        let earlier = t0() - chrono::Duration::minutes(5);
        let mut user = ContextProperties::new();
        user.insert("desk".into(), "fx".into());
        let created = SessionState::new(
            "s1",
            SessionRole::Initiating,
            bob(),
            true,
            ContextProperties::new(),
            earlier,
        )
        .with_user_properties(user.clone());
        checkpoint.put_session_state(created);

        let state = mgr.send_init(&checkpoint, init("s1"), t0()).unwrap();
        assert_eq!(state.created_at, earlier);
        assert_eq!(state.user_properties, user);
        assert_eq!(state.sent.last_sequence_num, 1);
        assert_eq!(state.sent.undelivered[0].payload.kind(), "INIT");
    }

    #[test]
    fn send_data_on_unknown_session_is_fatal() {
        let checkpoint = FlowCheckpoint::new("flow-1", alice(), vec![]);
        let mut payloads = BTreeMap::new();
        payloads.insert("ghost".to_string(), b"hi".to_vec());
        let err = manager().send_data(&checkpoint, &payloads, t0()).unwrap_err();
        assert!(matches!(err, Error::SessionMissing(ref id) if id == "ghost"));
        assert!(checkpoint.sessions().is_empty());
    }

    #[test]
    fn send_error_carries_envelope() {
        let mgr = manager();
        let mut checkpoint = FlowCheckpoint::new("flow-1", alice(), vec![]);
        let state = mgr.send_init(&checkpoint, init("s1"), t0()).unwrap();
        checkpoint.put_session_state(state);

        let states = mgr
            .send_error(
                &checkpoint,
                &["s1".to_string()],
                &ExceptionEnvelope::new("FlowRuntimeError", "boom"),
                t0(),
            )
            .unwrap();
        let last = states[0].sent.undelivered.last().unwrap();
        assert_eq!(last.payload.kind(), "ERROR");
        assert_eq!(last.sequence_num, Some(2));
    }

    #[test]
    fn status_queries() {
        let mgr = manager();
        let mut checkpoint = FlowCheckpoint::new("flow-1", alice(), vec![]);
        checkpoint.put_session_state(mgr.send_init(&checkpoint, init("s1"), t0()).unwrap());
        checkpoint.put_session_state(mgr.send_init(&checkpoint, init("s2"), t0()).unwrap());
        let ids = vec!["s1".to_string(), "s2".to_string()];

        assert!(mgr.all_have_status(&checkpoint, &ids, SessionStatus::Created).unwrap());
        assert!(mgr.with_status(&checkpoint, &ids, SessionStatus::Closed).unwrap().is_empty());
        assert!(mgr
            .all_have_status(&checkpoint, &["nope".to_string()], SessionStatus::Created)
            .is_err());
    }

    #[test]
    fn accept_init_negotiates_and_confirms() {
        let mgr = manager();
        let catalog = ProtocolCatalog::builder()
            .responder("ChatResponder", "chat", &[2], true)
            .build()
            .unwrap();

        let alice_cp = FlowCheckpoint::new("flow-a", alice(), vec![]);
        let opened = mgr.send_init(&alice_cp, init("s1"), t0()).unwrap();
        let mut delivered = opened.sent.undelivered[0].clone();
        delivered.session_id = "s1-INITIATED".into();

        let mut bob_cp = FlowCheckpoint::new("flow-b", bob(), vec![]);
        let accepted = mgr.accept_init(&mut bob_cp, &catalog, delivered, t0()).unwrap();

        assert_eq!(accepted.responder.flow, "ChatResponder");
        assert_eq!(accepted.responder.version, 2);
        assert_eq!(accepted.state.role, SessionRole::Initiated);
        assert_eq!(accepted.state.status, SessionStatus::Confirmed);
        assert_eq!(accepted.state.counterparty, alice());
        assert!(accepted.state.require_close());

        let confirm = accepted.state.sent.undelivered.last().unwrap();
        assert_eq!(confirm.payload.kind(), "CONFIRM");
        assert_eq!(confirm.received_sequence_num, 1);
        assert!(bob_cp.get_session_state("s1-INITIATED").is_some());
    }

    #[test]
    fn confirm_moves_created_to_confirmed() {
        let mgr = manager();
        let mut checkpoint = FlowCheckpoint::new("flow-a", alice(), vec![]);
        checkpoint.put_session_state(mgr.send_init(&checkpoint, init("s1"), t0()).unwrap());

        let mut confirm = SessionEvent::outbound(
            "s1",
            t0(),
            Some(alice()),
            Some(bob()),
            SessionPayload::Confirm {
                protocol: "chat".into(),
                version: 2,
            },
        );
        confirm.sequence_num = Some(1);
        confirm.received_sequence_num = 1;
        mgr.record_received(&mut checkpoint, confirm).unwrap();

        let state = checkpoint.get_session_state("s1").unwrap();
        assert_eq!(state.status, SessionStatus::Confirmed);
        // The INIT was acknowledged by the peer's watermark.
        assert!(state.sent.undelivered.is_empty());
    }

    fn peer_event(seq: u64, payload: SessionPayload) -> SessionEvent {
        let mut event = SessionEvent::outbound("s1", t0(), Some(alice()), Some(bob()), payload);
        event.sequence_num = Some(seq);
        event
    }

    #[test]
    fn error_behind_a_gap_waits_for_the_gap() {
        let mgr = manager();
        let mut checkpoint = FlowCheckpoint::new("flow-a", alice(), vec![]);
        checkpoint.put_session_state(mgr.send_init(&checkpoint, init("s1"), t0()).unwrap());

        let error = SessionPayload::Error {
            exception: ExceptionEnvelope::new("FlowRuntimeError", "boom"),
        };
        mgr.record_received(&mut checkpoint, peer_event(2, error)).unwrap();
        let state = checkpoint.get_session_state("s1").unwrap();
        assert_eq!(state.status, SessionStatus::Created);
        assert_eq!(state.received.last_processed_sequence_num, 0);

        let confirm = SessionPayload::Confirm {
            protocol: "chat".into(),
            version: 2,
        };
        mgr.record_received(&mut checkpoint, peer_event(1, confirm)).unwrap();
        let state = checkpoint.get_session_state("s1").unwrap();
        assert_eq!(state.status, SessionStatus::Error);
        assert_eq!(state.received.last_processed_sequence_num, 2);
    }

    #[test]
    fn confirmed_session_ignores_an_out_of_order_error() {
        let mgr = manager();
        let mut checkpoint = FlowCheckpoint::new("flow-a", alice(), vec![]);
        let mut state = mgr.send_init(&checkpoint, init("s1"), t0()).unwrap();
        state.transition_to(SessionStatus::Confirmed).unwrap();
        state.received.last_processed_sequence_num = 1;
        checkpoint.put_session_state(state);

        let error = SessionPayload::Error {
            exception: ExceptionEnvelope::new("FlowRuntimeError", "late"),
        };
        mgr.record_received(&mut checkpoint, peer_event(3, error)).unwrap();
        assert_eq!(
            checkpoint.get_session_state("s1").unwrap().status,
            SessionStatus::Confirmed
        );

        let data = SessionPayload::Data {
            payload: b"x".to_vec(),
        };
        mgr.record_received(&mut checkpoint, peer_event(2, data)).unwrap();
        assert_eq!(
            checkpoint.get_session_state("s1").unwrap().status,
            SessionStatus::Error
        );
    }
}
