use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ordered delivery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Upper bound accepted for `resend_window_ms`: one day.
pub const MAX_RESEND_WINDOW_MS: u64 = 86_400_000;

/// Tuning for the sequenced channel that carries session events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Maximum inbound events held per session while waiting for a gap to
    /// close.  Arrivals beyond this are dropped and rely on redelivery.
    #[serde(default = "d_max_buffered")]
    pub max_buffered_events: usize,

    /// Unacknowledged outbound events older than this are due for resend.
    #[serde(default = "d_resend_window_ms")]
    pub resend_window_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_buffered_events: d_max_buffered(),
            resend_window_ms: d_resend_window_ms(),
        }
    }
}

fn d_max_buffered() -> usize {
    128
}
fn d_resend_window_ms() -> u64 {
    5_000
}
