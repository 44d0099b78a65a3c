//! Flow session protocol: the events exchanged between two flows over a
//! session, the identities on each end, and the catalog that binds flows to
//! named, versioned protocols.
//!
//! Byte layout is the transport's concern; these types only fix the fields
//! every event carries.

pub mod catalog;

pub use catalog::{NegotiatedProtocol, ProtocolCatalog, ProtocolCatalogBuilder};

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Context property carrying the protocol name on an INIT.
pub const PROTOCOL_PROPERTY: &str = "fm.protocol";
/// Context property carrying the initiator's supported versions (JSON array).
pub const PROTOCOL_VERSIONS_PROPERTY: &str = "fm.protocol.versions";
/// Context property carrying the session's `requireClose` policy.
pub const REQUIRE_CLOSE_PROPERTY: &str = "fm.session.requireClose";

/// Free-form string properties attached to a session.
pub type ContextProperties = BTreeMap<String, String>;

/// A virtual node's identity: an X.500 name within a membership group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HoldingIdentity {
    pub x500_name: String,
    pub group_id: String,
}

impl HoldingIdentity {
    pub fn new(x500_name: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            x500_name: x500_name.into(),
            group_id: group_id.into(),
        }
    }
}

impl fmt::Display for HoldingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.x500_name, self.group_id)
    }
}

/// One version of a named protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub protocol: String,
    pub version: u32,
}

impl ProtocolVersion {
    pub fn new(protocol: impl Into<String>, version: u32) -> Self {
        Self {
            protocol: protocol.into(),
            version,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/v{}", self.protocol, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

/// Exception details carried by an ERROR event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionEnvelope {
    pub error_type: String,
    pub error_message: String,
}

impl ExceptionEnvelope {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
        }
    }
}

/// Session event body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionPayload {
    /// Initiator → responder: open the session.
    Init {
        protocol: String,
        versions: Vec<u32>,
        #[serde(default)]
        context_user_properties: ContextProperties,
        #[serde(default)]
        context_platform_properties: ContextProperties,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Vec<u8>>,
    },
    /// Responder → initiator: the session was accepted at `version`.
    Confirm { protocol: String, version: u32 },
    Data { payload: Vec<u8> },
    Close,
    Error { exception: ExceptionEnvelope },
}

impl SessionPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "INIT",
            Self::Confirm { .. } => "CONFIRM",
            Self::Data { .. } => "DATA",
            Self::Close => "CLOSE",
            Self::Error { .. } => "ERROR",
        }
    }
}

/// A single event on a session.
///
/// `sequence_num` is assigned by the sequenced channel at send time;
/// `received_sequence_num` and `out_of_order_sequence_nums` piggyback the
/// sender's inbound watermark so the peer can release its send buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    pub direction: MessageDirection,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sequence_num: Option<u64>,
    #[serde(default)]
    pub received_sequence_num: u64,
    #[serde(default)]
    pub out_of_order_sequence_nums: Vec<u64>,
    #[serde(default)]
    pub initiating_identity: Option<HoldingIdentity>,
    #[serde(default)]
    pub initiated_identity: Option<HoldingIdentity>,
    pub payload: SessionPayload,
}

impl SessionEvent {
    /// Build an outbound event with no sequencing information yet.
    pub fn outbound(
        session_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        initiating_identity: Option<HoldingIdentity>,
        initiated_identity: Option<HoldingIdentity>,
        payload: SessionPayload,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            direction: MessageDirection::Outbound,
            timestamp,
            sequence_num: None,
            received_sequence_num: 0,
            out_of_order_sequence_nums: Vec::new(),
            initiating_identity,
            initiated_identity,
            payload,
        }
    }
}
