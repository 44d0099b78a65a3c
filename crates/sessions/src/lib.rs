//! Session lifecycle for flows talking to peer flows.
//!
//! A flow opens sessions lazily ([`SessionActivation`]), exchanges ordered
//! events over a [`SequencedChannel`] through the [`SessionLifecycleManager`],
//! and shuts them down with the role-asymmetric close handshake in
//! [`CloseOrchestrator`].  All state lives in the flow's [`FlowCheckpoint`].

pub mod activation;
pub mod channel;
pub mod checkpoint;
pub mod close;
pub mod manager;
pub mod registry;
pub mod sandbox;
pub mod state;

pub use activation::{SessionActivation, SessionInfo};
pub use channel::{OrderedChannel, SequencedChannel};
pub use checkpoint::{FlowCheckpoint, FlowStack, FlowStackItem, FlowStackSession};
pub use close::CloseOrchestrator;
pub use manager::{
    initiating_and_initiated_identity, AcceptedSession, SessionInit, SessionLifecycleManager,
};
pub use registry::SessionRegistry;
pub use sandbox::{ProtocolSandboxResolver, StaticSandboxResolver};
pub use state::{
    counterparty_session_id, initiated_session_id, SessionRole, SessionState, SessionStatus,
};
