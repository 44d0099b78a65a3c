use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Session defaults applied when a flow opens a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Whether new sessions require the two-phase close handshake unless
    /// the flow says otherwise.
    #[serde(default = "d_true")]
    pub default_require_close: bool,

    /// Send the INIT message as soon as a session is activated.  When
    /// `false` the session id and protocol are reserved and the INIT goes
    /// out with the first data message.
    #[serde(default = "d_true")]
    pub send_init_immediately: bool,

    /// Marker appended to the session id on the invoked (responder) side.
    #[serde(default = "d_initiated_suffix")]
    pub initiated_suffix: String,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            default_require_close: true,
            send_init_immediately: true,
            initiated_suffix: d_initiated_suffix(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_initiated_suffix() -> String {
    "-INITIATED".into()
}
