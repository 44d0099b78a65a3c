use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Protocol registration table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Flow-to-protocol bindings for one deployment unit.
///
/// ```toml
/// [[protocols.initiators]]
/// flow = "ChatInitiator"
/// protocol = "chat"
/// versions = [1, 2]
///
/// [[protocols.responders]]
/// flow = "ChatResponder"
/// protocol = "chat"
/// versions = [2]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProtocolsConfig {
    #[serde(default)]
    pub initiators: Vec<InitiatorDeclaration>,
    #[serde(default)]
    pub responders: Vec<ResponderDeclaration>,
}

/// A flow that opens sessions under `protocol`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatorDeclaration {
    pub flow: String,
    pub protocol: String,
    pub versions: Vec<u32>,
}

/// A flow invoked when a peer opens a session under `protocol`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderDeclaration {
    pub flow: String,
    pub protocol: String,
    pub versions: Vec<u32>,
    /// Whether the flow actually implements the responder entry point.
    /// A declaration on a flow that does not is rejected at build time.
    #[serde(default = "d_true")]
    pub responder_flow: bool,
}

fn d_true() -> bool {
    true
}
