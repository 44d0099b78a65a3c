use serde::Serialize;

/// Structured trace events emitted across all FlowMesh crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    ProtocolNegotiated {
        protocol: String,
        offered_versions: Vec<u32>,
        responder: String,
        version: u32,
    },
    SessionCreated {
        session_id: String,
        counterparty: String,
        role: String,
        require_close: bool,
    },
    SessionMessageSent {
        session_id: String,
        kind: String,
        sequence_num: u64,
    },
    SessionStatusChanged {
        session_id: String,
        from: String,
        to: String,
    },
    SessionsActivated {
        flow: String,
        protocol: String,
        sessions: usize,
        init_sent: bool,
    },
    CloseHandshake {
        initiated_closed: usize,
        closing: usize,
        closed: usize,
        skipped: usize,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "fm_event");
    }
}
