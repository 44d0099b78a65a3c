//! Ordered, at-least-once delivery for session events.
//!
//! [`SequencedChannel`] is the contract the session manager relies on;
//! [`OrderedChannel`] is the in-process implementation.  Sequence numbers
//! start at 1 per session and per direction.  Inbound events are surfaced
//! strictly in order; gaps hold later arrivals in a bounded buffer until
//! the missing event is redelivered.

use chrono::{DateTime, Duration, Utc};

use fm_domain::config::ChannelConfig;
use fm_domain::error::Result;
use fm_domain::trace::TraceEvent;
use fm_protocol::{MessageDirection, SessionEvent, SessionPayload};

use crate::state::SessionState;

/// Sequencing and redelivery for the events of one session.
pub trait SequencedChannel: Send + Sync {
    /// Assign the next outbound sequence number to `event` and record it for
    /// redelivery.  With no `prior` state the event must be an INIT, and a
    /// fresh `CREATED` state is built from it.
    fn send(
        &self,
        key: &str,
        prior: Option<SessionState>,
        event: SessionEvent,
        now: DateTime<Utc>,
    ) -> Result<SessionState>;

    /// Record an event that arrived from the peer.
    fn receive(&self, state: SessionState, event: SessionEvent) -> SessionState;

    /// The next inbound event in sequence order, if it has arrived.
    fn next_received(&self, state: &SessionState) -> Option<SessionEvent>;

    /// Mark an inbound event as consumed.  Idempotent.
    fn acknowledge(&self, state: &mut SessionState, sequence_num: u64);

    /// Events that should go on the wire now: never-transmitted events plus
    /// unacknowledged ones whose resend window has elapsed.
    fn messages_to_send(
        &self,
        state: &mut SessionState,
        now: DateTime<Utc>,
    ) -> Vec<SessionEvent>;
}

/// In-process [`SequencedChannel`].
#[derive(Debug, Clone, Default)]
pub struct OrderedChannel {
    config: ChannelConfig,
}

impl OrderedChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self { config }
    }
}

impl SequencedChannel for OrderedChannel {
    fn send(
        &self,
        key: &str,
        prior: Option<SessionState>,
        mut event: SessionEvent,
        now: DateTime<Utc>,
    ) -> Result<SessionState> {
        let mut state = match prior {
            Some(state) => state,
            None => SessionState::from_init(&event)?,
        };

        let seq = state.sent.last_sequence_num + 1;
        state.sent.last_sequence_num = seq;
        event.sequence_num = Some(seq);
        event.direction = MessageDirection::Outbound;
        event.timestamp = now;

        // INIT carries its own fixed watermark; everything else piggybacks ours.
        if !matches!(event.payload, SessionPayload::Init { .. }) {
            event.received_sequence_num = state.received.last_processed_sequence_num;
            event.out_of_order_sequence_nums = state.received.out_of_order_sequence_nums();
        }

        tracing::debug!(
            key = %key,
            session_id = %event.session_id,
            kind = event.payload.kind(),
            seq,
            "session event queued"
        );
        TraceEvent::SessionMessageSent {
            session_id: event.session_id.clone(),
            kind: event.payload.kind().into(),
            sequence_num: seq,
        }
        .emit();

        state.sent.undelivered.push(event);
        Ok(state)
    }

    fn receive(&self, mut state: SessionState, mut event: SessionEvent) -> SessionState {
        // The peer's watermark releases our own send buffer.
        let acked = event.received_sequence_num;
        let out_of_order = &event.out_of_order_sequence_nums;
        state.sent.undelivered.retain(|sent| {
            let seq = sent.sequence_num.unwrap_or_default();
            seq > acked && !out_of_order.contains(&seq)
        });

        let Some(seq) = event.sequence_num else {
            tracing::warn!(
                session_id = %state.session_id,
                kind = event.payload.kind(),
                "dropping inbound event without a sequence number"
            );
            return state;
        };

        let received = &mut state.received;
        if seq <= received.last_processed_sequence_num || received.undelivered.contains_key(&seq) {
            tracing::debug!(session_id = %state.session_id, seq, "duplicate event ignored");
            return state;
        }

        let fills_gap = seq == received.last_processed_sequence_num + 1;
        if !fills_gap && received.undelivered.len() >= self.config.max_buffered_events {
            tracing::warn!(
                session_id = %state.session_id,
                seq,
                buffered = received.undelivered.len(),
                "out-of-order buffer full, relying on redelivery"
            );
            return state;
        }

        event.direction = MessageDirection::Inbound;
        received.undelivered.insert(seq, event);
        while received
            .undelivered
            .contains_key(&(received.last_processed_sequence_num + 1))
        {
            received.last_processed_sequence_num += 1;
        }

        state
    }

    fn next_received(&self, state: &SessionState) -> Option<SessionEvent> {
        let (seq, event) = state.received.undelivered.iter().next()?;
        (*seq <= state.received.last_processed_sequence_num).then(|| event.clone())
    }

    fn acknowledge(&self, state: &mut SessionState, sequence_num: u64) {
        state.received.undelivered.remove(&sequence_num);
    }

    fn messages_to_send(
        &self,
        state: &mut SessionState,
        now: DateTime<Utc>,
    ) -> Vec<SessionEvent> {
        // A window too large to represent never elapses.
        let window = i64::try_from(self.config.resend_window_ms)
            .ok()
            .and_then(Duration::try_milliseconds);
        let transmitted = state.sent.last_transmitted_sequence_num;

        let mut out = Vec::new();
        for event in &mut state.sent.undelivered {
            let seq = event.sequence_num.unwrap_or_default();
            let due = window
                .and_then(|w| event.timestamp.checked_add_signed(w))
                .is_some_and(|deadline| deadline <= now);
            if seq > transmitted || due {
                event.timestamp = now;
                out.push(event.clone());
            }
        }
        state.sent.last_transmitted_sequence_num = state.sent.last_sequence_num;
        out
    }
}
