//! The close handshake.
//!
//! The initiating side closes in two phases when the session requires it:
//! the first call moves it to `CLOSING` and sends CLOSE, a later call made
//! while still `CLOSING` finalizes it.  The initiated side announces its
//! close once and never waits.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use fm_domain::error::Result;
use fm_domain::trace::TraceEvent;

use crate::checkpoint::FlowCheckpoint;
use crate::manager::SessionLifecycleManager;
use crate::state::{SessionState, SessionStatus};

pub struct CloseOrchestrator {
    manager: Arc<SessionLifecycleManager>,
}

impl CloseOrchestrator {
    pub fn new(manager: Arc<SessionLifecycleManager>) -> Self {
        Self { manager }
    }

    /// Initiating sessions that still have to see the peer acknowledge
    /// their close.
    pub fn waiting_for_close_confirmation(
        &self,
        checkpoint: &FlowCheckpoint,
        session_ids: &[String],
    ) -> Result<Vec<String>> {
        let (initiating, _) = self.manager.partition_by_role(checkpoint, session_ids)?;
        Ok(initiating
            .into_iter()
            .filter(|s| !s.status.is_terminal() && s.require_close())
            .map(|s| s.session_id)
            .collect())
    }

    pub fn close_sessions(
        &self,
        checkpoint: &mut FlowCheckpoint,
        session_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (initiating, initiated) = self.manager.partition_by_role(checkpoint, session_ids)?;

        // Initiated side: CLOSE goes out whatever the status.
        let initiated_ids: Vec<String> = initiated.iter().map(|s| s.session_id.clone()).collect();
        let mut updated = self.manager.send_close(checkpoint, &initiated_ids, now)?;
        for state in &mut updated {
            if !state.status.is_terminal() {
                state.transition_to(SessionStatus::Closed)?;
            }
        }
        let initiated_closed = updated.len();

        let live: Vec<SessionState> = initiating
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect();
        let skipped = session_ids.len() - initiated_closed - live.len();
        let (handshake, one_shot): (Vec<_>, Vec<_>) =
            live.into_iter().partition(|s| s.require_close());

        let mut closed = 0;
        let mut to_announce = Vec::new();
        for mut state in handshake {
            if state.status == SessionStatus::Closing {
                state.transition_to(SessionStatus::Closed)?;
                updated.push(state);
                closed += 1;
            } else {
                to_announce.push(state.session_id);
            }
        }

        // Sent from the stored CREATED/CONFIRMED state so a deferred INIT
        // still precedes the CLOSE.
        let mut announced = self.manager.send_close(checkpoint, &to_announce, now)?;
        for state in &mut announced {
            state.transition_to(SessionStatus::Closing)?;
        }
        let closing = announced.len();
        updated.extend(announced);

        for mut state in one_shot {
            state.transition_to(SessionStatus::Closed)?;
            updated.push(state);
            closed += 1;
        }

        tracing::debug!(
            flow_id = %checkpoint.flow_id,
            initiated_closed,
            closing,
            closed,
            skipped,
            "close handshake step"
        );
        TraceEvent::CloseHandshake {
            initiated_closed,
            closing,
            closed,
            skipped,
        }
        .emit();

        checkpoint.put_session_states(updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fm_domain::config::{ChannelConfig, SessionsConfig};
    use fm_protocol::{
        ContextProperties, HoldingIdentity, PROTOCOL_PROPERTY, PROTOCOL_VERSIONS_PROPERTY,
        REQUIRE_CLOSE_PROPERTY,
    };

    use crate::channel::OrderedChannel;
    use crate::state::SessionRole;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
    }

    fn bob() -> HoldingIdentity {
        HoldingIdentity::new("O=Bob, L=Paris, C=FR", "g")
    }

    fn orchestrator() -> CloseOrchestrator {
        CloseOrchestrator::new(Arc::new(SessionLifecycleManager::new(
            Arc::new(OrderedChannel::new(ChannelConfig::default())),
            &SessionsConfig::default(),
        )))
    }

    /// A session with one message already sent so no deferred INIT is due.
    fn session(
        id: &str,
        role: SessionRole,
        status: SessionStatus,
        require_close: bool,
    ) -> SessionState {
        let mut state = SessionState::new(
            id,
            role,
            bob(),
            require_close,
            ContextProperties::new(),
            t0(),
        );
        state.status = status;
        state.sent.last_sequence_num = 1;
        state
    }

    fn checkpoint(states: Vec<SessionState>) -> FlowCheckpoint {
        let mut cp = FlowCheckpoint::new(
            "flow-1",
            HoldingIdentity::new("O=Alice, L=London, C=GB", "g"),
            vec![],
        );
        cp.put_session_states(states);
        cp
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn closes_sent(cp: &FlowCheckpoint, id: &str) -> usize {
        cp.get_session_state(id)
            .unwrap()
            .sent
            .undelivered
            .iter()
            .filter(|e| e.payload.kind() == "CLOSE")
            .count()
    }

    #[test]
    fn closing_closed_session_is_a_no_op() {
        let orch = orchestrator();
        let mut cp = checkpoint(vec![session(
            "s1",
            SessionRole::Initiating,
            SessionStatus::Closed,
            true,
        )]);
        orch.close_sessions(&mut cp, &ids(&["s1"]), t0()).unwrap();
        assert_eq!(cp.get_session_state("s1").unwrap().status, SessionStatus::Closed);
        assert_eq!(closes_sent(&cp, "s1"), 0);
    }

    #[test]
    fn no_require_close_skips_handshake() {
        let orch = orchestrator();
        let mut cp = checkpoint(vec![session(
            "s1",
            SessionRole::Initiating,
            SessionStatus::Created,
            false,
        )]);
        orch.close_sessions(&mut cp, &ids(&["s1"]), t0()).unwrap();
        assert_eq!(cp.get_session_state("s1").unwrap().status, SessionStatus::Closed);
        assert_eq!(closes_sent(&cp, "s1"), 0);
    }

    #[test]
    fn two_phase_handshake() {
        let orch = orchestrator();
        let mut cp = checkpoint(vec![session(
            "s1",
            SessionRole::Initiating,
            SessionStatus::Created,
            true,
        )]);

        orch.close_sessions(&mut cp, &ids(&["s1"]), t0()).unwrap();
        assert_eq!(cp.get_session_state("s1").unwrap().status, SessionStatus::Closing);
        assert_eq!(closes_sent(&cp, "s1"), 1);
        assert_eq!(orch.waiting_for_close_confirmation(&cp, &ids(&["s1"])).unwrap(), ids(&["s1"]));

        orch.close_sessions(&mut cp, &ids(&["s1"]), t0()).unwrap();
        assert_eq!(cp.get_session_state("s1").unwrap().status, SessionStatus::Closed);
        assert_eq!(closes_sent(&cp, "s1"), 1);
        assert!(orch.waiting_for_close_confirmation(&cp, &ids(&["s1"])).unwrap().is_empty());
    }

    #[test]
    fn initiated_side_always_announces() {
        let orch = orchestrator();
        let mut cp = checkpoint(vec![
            session("a-INITIATED", SessionRole::Initiated, SessionStatus::Confirmed, true),
            session("b-INITIATED", SessionRole::Initiated, SessionStatus::Confirmed, false),
            session("c-INITIATED", SessionRole::Initiated, SessionStatus::Error, true),
        ]);
        orch.close_sessions(&mut cp, &ids(&["a-INITIATED", "b-INITIATED", "c-INITIATED"]), t0())
            .unwrap();

        for id in ["a-INITIATED", "b-INITIATED", "c-INITIATED"] {
            assert_eq!(closes_sent(&cp, id), 1, "{id}");
        }
        assert_eq!(cp.get_session_state("a-INITIATED").unwrap().status, SessionStatus::Closed);
        assert_eq!(cp.get_session_state("b-INITIATED").unwrap().status, SessionStatus::Closed);
        assert_eq!(cp.get_session_state("c-INITIATED").unwrap().status, SessionStatus::Error);
    }

    #[test]
    fn waiting_set_excludes_initiated_terminal_and_one_shot() {
        let orch = orchestrator();
        let cp = checkpoint(vec![
            session("open", SessionRole::Initiating, SessionStatus::Confirmed, true),
            session("failed", SessionRole::Initiating, SessionStatus::Error, true),
            session("oneshot", SessionRole::Initiating, SessionStatus::Confirmed, false),
            session("x-INITIATED", SessionRole::Initiated, SessionStatus::Confirmed, true),
        ]);
        let all = ids(&["open", "failed", "oneshot", "x-INITIATED"]);
        let waiting = orch.waiting_for_close_confirmation(&cp, &all).unwrap();
        assert_eq!(waiting, ids(&["open"]));
    }

    #[test]
    fn deferred_init_precedes_the_close() {
        let orch = orchestrator();
        let mut properties = ContextProperties::new();
        properties.insert(PROTOCOL_PROPERTY.into(), "chat".into());
        properties.insert(PROTOCOL_VERSIONS_PROPERTY.into(), "[1,2]".into());
        properties.insert(REQUIRE_CLOSE_PROPERTY.into(), "true".into());
        let unopened =
            SessionState::new("s1", SessionRole::Initiating, bob(), true, properties, t0());
        let mut cp = checkpoint(vec![unopened]);

        orch.close_sessions(&mut cp, &ids(&["s1"]), t0()).unwrap();

        let state = cp.get_session_state("s1").unwrap();
        assert_eq!(state.status, SessionStatus::Closing);
        let sent: Vec<_> = state
            .sent
            .undelivered
            .iter()
            .map(|e| (e.payload.kind(), e.sequence_num))
            .collect();
        assert_eq!(sent, vec![("INIT", Some(1)), ("CLOSE", Some(2))]);
    }

    #[test]
    fn close_on_unknown_session_is_fatal() {
        let orch = orchestrator();
        let mut cp = checkpoint(vec![]);
        assert!(orch.close_sessions(&mut cp, &ids(&["ghost"]), t0()).is_err());
    }
}
