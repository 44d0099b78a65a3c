//! Persistent per-session state owned by a flow checkpoint.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fm_domain::error::{Error, Result};
use fm_domain::trace::TraceEvent;
use fm_protocol::{
    ContextProperties, HoldingIdentity, SessionEvent, SessionPayload, REQUIRE_CLOSE_PROPERTY,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status & role
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Created,
    Confirmed,
    Closing,
    Closed,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Confirmed => "CONFIRMED",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which end of the session the local flow is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    /// The local flow opened the session.
    Initiating,
    /// The local flow was invoked by a peer's INIT.
    Initiated,
}

impl SessionRole {
    /// Derive the role from a session id.  Only used when a state is first
    /// created; afterwards the stored role is authoritative.
    pub fn of(session_id: &str, initiated_suffix: &str) -> Self {
        if !initiated_suffix.is_empty() && session_id.ends_with(initiated_suffix) {
            Self::Initiated
        } else {
            Self::Initiating
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiating => "initiating",
            Self::Initiated => "initiated",
        }
    }
}

/// The id the responder side uses for an initiator's session id.
pub fn initiated_session_id(session_id: &str, initiated_suffix: &str) -> String {
    format!("{session_id}{initiated_suffix}")
}

/// The id the other end of the session knows this session by.
pub fn counterparty_session_id(session_id: &str, initiated_suffix: &str) -> String {
    match session_id.strip_suffix(initiated_suffix) {
        Some(base) if !initiated_suffix.is_empty() => base.to_owned(),
        _ => initiated_session_id(session_id, initiated_suffix),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sequencing bookkeeping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outbound side: last assigned sequence number and events the peer has
/// not yet acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEventsState {
    pub last_sequence_num: u64,
    /// Highest sequence number handed to the transport at least once.
    #[serde(default)]
    pub last_transmitted_sequence_num: u64,
    #[serde(default)]
    pub undelivered: Vec<SessionEvent>,
}

/// Inbound side: contiguous watermark plus events not yet consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedEventsState {
    pub last_processed_sequence_num: u64,
    #[serde(default)]
    pub undelivered: BTreeMap<u64, SessionEvent>,
}

impl ReceivedEventsState {
    /// Buffered sequence numbers above the watermark (gaps not yet closed).
    pub fn out_of_order_sequence_nums(&self) -> Vec<u64> {
        self.undelivered
            .range(self.last_processed_sequence_num + 1..)
            .map(|(seq, _)| *seq)
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One session as persisted in its flow's checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub role: SessionRole,
    pub status: SessionStatus,
    pub counterparty: HoldingIdentity,
    require_close: bool,
    /// Platform context properties: protocol, versions, close policy.
    #[serde(default)]
    pub properties: ContextProperties,
    #[serde(default)]
    pub user_properties: ContextProperties,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sent: SendEventsState,
    #[serde(default)]
    pub received: ReceivedEventsState,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        role: SessionRole,
        counterparty: HoldingIdentity,
        require_close: bool,
        properties: ContextProperties,
        now: DateTime<Utc>,
    ) -> Self {
        let state = Self {
            session_id: session_id.into(),
            role,
            status: SessionStatus::Created,
            counterparty,
            require_close,
            properties,
            user_properties: ContextProperties::new(),
            created_at: now,
            sent: SendEventsState::default(),
            received: ReceivedEventsState::default(),
        };

        TraceEvent::SessionCreated {
            session_id: state.session_id.clone(),
            counterparty: state.counterparty.to_string(),
            role: role.as_str().into(),
            require_close,
        }
        .emit();

        state
    }

    /// Create the initiating side's state from the INIT it is about to send.
    pub fn from_init(event: &SessionEvent) -> Result<Self> {
        let SessionPayload::Init {
            context_user_properties,
            context_platform_properties,
            ..
        } = &event.payload
        else {
            return Err(Error::Other(format!(
                "session {} has no state and cannot start with a {} event",
                event.session_id,
                event.payload.kind()
            )));
        };

        let counterparty = event.initiated_identity.clone().ok_or_else(|| {
            Error::Other(format!(
                "INIT for session {} does not name its counterparty",
                event.session_id
            ))
        })?;

        let require_close = context_platform_properties
            .get(REQUIRE_CLOSE_PROPERTY)
            .map_or(true, |v| v == "true");

        Ok(Self::new(
            event.session_id.clone(),
            SessionRole::Initiating,
            counterparty,
            require_close,
            context_platform_properties.clone(),
            event.timestamp,
        )
        .with_user_properties(context_user_properties.clone()))
    }

    pub fn with_user_properties(mut self, user_properties: ContextProperties) -> Self {
        self.user_properties = user_properties;
        self
    }

    /// Fixed at creation.
    pub fn require_close(&self) -> bool {
        self.require_close
    }

    /// Move to `next`, rejecting any transition that would go backwards.
    ///
    /// Legal: `CREATED → CONFIRMED`, `{CREATED, CONFIRMED} → CLOSING`,
    /// `CLOSING → CLOSED`, non-terminal `→ ERROR`, and non-terminal
    /// `→ CLOSED` when the session does not require a close handshake or
    /// the local side is the initiated one.
    pub fn transition_to(&mut self, next: SessionStatus) -> Result<()> {
        use SessionStatus as S;

        let from = self.status;
        if from == next {
            return Ok(());
        }

        let skip_handshake = !self.require_close || self.role == SessionRole::Initiated;
        let legal = match (from, next) {
            (S::Created, S::Confirmed) => true,
            (S::Created | S::Confirmed, S::Closing) => true,
            (S::Closing, S::Closed) => true,
            (S::Created | S::Confirmed | S::Closing, S::Error) => true,
            (S::Created | S::Confirmed, S::Closed) => skip_handshake,
            _ => false,
        };

        if !legal {
            return Err(Error::IllegalTransition {
                session_id: self.session_id.clone(),
                from: from.to_string(),
                to: next.to_string(),
            });
        }

        self.status = next;
        TraceEvent::SessionStatusChanged {
            session_id: self.session_id.clone(),
            from: from.to_string(),
            to: next.to_string(),
        }
        .emit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SUFFIX: &str = "-INITIATED";

    fn state(require_close: bool, role: SessionRole) -> SessionState {
        SessionState::new(
            "s1",
            role,
            HoldingIdentity::new("O=Bob, L=Paris, C=FR", "g"),
            require_close,
            ContextProperties::new(),
            Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap(),
        )
    }

    #[test]
    fn role_from_suffix() {
        assert_eq!(SessionRole::of("abc", SUFFIX), SessionRole::Initiating);
        assert_eq!(SessionRole::of("abc-INITIATED", SUFFIX), SessionRole::Initiated);
    }

    #[test]
    fn counterparty_id_toggles_suffix() {
        assert_eq!(counterparty_session_id("abc", SUFFIX), "abc-INITIATED");
        assert_eq!(counterparty_session_id("abc-INITIATED", SUFFIX), "abc");
    }

    #[test]
    fn handshake_path_is_legal() {
        let mut s = state(true, SessionRole::Initiating);
        s.transition_to(SessionStatus::Confirmed).unwrap();
        s.transition_to(SessionStatus::Closing).unwrap();
        s.transition_to(SessionStatus::Closed).unwrap();
        assert_eq!(s.status, SessionStatus::Closed);
    }

    #[test]
    fn require_close_blocks_direct_close() {
        let mut s = state(true, SessionRole::Initiating);
        let err = s.transition_to(SessionStatus::Closed).unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
        assert_eq!(s.status, SessionStatus::Created);
    }

    #[test]
    fn fire_and_forget_closes_directly() {
        let mut s = state(false, SessionRole::Initiating);
        s.transition_to(SessionStatus::Closed).unwrap();
        assert_eq!(s.status, SessionStatus::Closed);
    }

    #[test]
    fn terminal_states_never_move() {
        let mut s = state(true, SessionRole::Initiating);
        s.transition_to(SessionStatus::Error).unwrap();
        assert!(s.transition_to(SessionStatus::Closing).is_err());
        assert!(s.transition_to(SessionStatus::Closed).is_err());
        // Same-status transitions are no-ops.
        s.transition_to(SessionStatus::Error).unwrap();
    }

    #[test]
    fn illegal_transition_names_both_statuses() {
        let mut s = state(true, SessionRole::Initiated);
        s.transition_to(SessionStatus::Error).unwrap();
        let err = s.transition_to(SessionStatus::Confirmed).unwrap_err();
        assert_eq!(
            err.to_string(),
            "session s1: illegal status transition ERROR -> CONFIRMED"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn no_backward_transition() {
        let mut s = state(true, SessionRole::Initiating);
        s.transition_to(SessionStatus::Closing).unwrap();
        assert!(s.transition_to(SessionStatus::Confirmed).is_err());
    }

    #[test]
    fn out_of_order_lists_only_above_watermark() {
        let mut received = ReceivedEventsState::default();
        received.last_processed_sequence_num = 2;
        let ev = SessionEvent::outbound(
            "s1",
            Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap(),
            None,
            None,
            SessionPayload::Close,
        );
        received.undelivered.insert(2, ev.clone());
        received.undelivered.insert(5, ev.clone());
        received.undelivered.insert(7, ev);
        assert_eq!(received.out_of_order_sequence_nums(), vec![5, 7]);
    }

    #[test]
    fn state_survives_checkpoint_serialization() {
        let s = state(false, SessionRole::Initiated);
        let json = serde_json::to_string(&s).unwrap();
        let back: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
        assert!(!back.require_close());
    }
}
