//! Protocol catalog — which protocol an initiating flow speaks, and which
//! responder flow answers each `(protocol, version)`.
//!
//! Built once per deployment unit from an explicit registration table and
//! never mutated afterwards.  Negotiation always picks the highest version
//! both sides understand.

use std::collections::HashMap;

use fm_domain::config::ProtocolsConfig;
use fm_domain::error::{Error, Result};
use fm_domain::trace::TraceEvent;

use crate::ProtocolVersion;

/// The outcome of matching offered versions against registered flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedProtocol {
    pub protocol: String,
    pub flow: String,
    pub version: u32,
}

/// Immutable lookup tables for one deployment unit.
#[derive(Debug, Clone, Default)]
pub struct ProtocolCatalog {
    /// initiator flow → one entry per supported version
    initiator_protocols: HashMap<String, Vec<ProtocolVersion>>,
    responder_for_version: HashMap<ProtocolVersion, String>,
    initiator_for_version: HashMap<ProtocolVersion, String>,
}

impl ProtocolCatalog {
    pub fn builder() -> ProtocolCatalogBuilder {
        ProtocolCatalogBuilder::default()
    }

    /// Build a catalog from the `[protocols]` config table.
    pub fn from_config(config: &ProtocolsConfig) -> Result<Self> {
        let mut builder = Self::builder();
        for init in &config.initiators {
            builder.initiator(&init.flow, &init.protocol, &init.versions);
        }
        for resp in &config.responders {
            builder.responder(&resp.flow, &resp.protocol, &resp.versions, resp.responder_flow);
        }
        builder.build()
    }

    /// The protocol name and versions declared by an initiating flow.
    pub fn protocols_for_initiator(&self, flow: &str) -> Result<(String, Vec<u32>)> {
        let entries = self.initiator_protocols.get(flow).ok_or_else(|| {
            Error::Protocol(format!(
                "no protocol declared for initiating flow {flow}; \
                 initiating flows must declare their protocol at deploy time"
            ))
        })?;

        let Some(first) = entries.first() else {
            return Err(Error::Protocol(format!(
                "initiating flow {flow} declares no protocol versions"
            )));
        };

        if let Some(other) = entries.iter().find(|e| e.protocol != first.protocol) {
            return Err(Error::Protocol(format!(
                "initiating flow {flow} declares more than one protocol ({} and {})",
                first.protocol, other.protocol
            )));
        }

        let versions = entries.iter().map(|e| e.version).collect();
        Ok((first.protocol.clone(), versions))
    }

    /// Pick the responder for the highest offered version that has one.
    pub fn responder_for_protocol(
        &self,
        protocol: &str,
        supported_versions: &[u32],
    ) -> Result<NegotiatedProtocol> {
        let negotiated = highest_match(&self.responder_for_version, protocol, supported_versions)
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "no responder is registered for protocol {protocol} at versions {:?}; \
                     registered responders: {}",
                    descending(supported_versions),
                    describe(&self.responder_for_version)
                ))
            })?;

        TraceEvent::ProtocolNegotiated {
            protocol: negotiated.protocol.clone(),
            offered_versions: supported_versions.to_vec(),
            responder: negotiated.flow.clone(),
            version: negotiated.version,
        }
        .emit();

        Ok(negotiated)
    }

    /// Mirror of [`responder_for_protocol`](Self::responder_for_protocol)
    /// for resolving the initiating flow of a protocol.
    pub fn initiator_for_protocol(
        &self,
        protocol: &str,
        supported_versions: &[u32],
    ) -> Result<NegotiatedProtocol> {
        highest_match(&self.initiator_for_version, protocol, supported_versions).ok_or_else(
            || {
                Error::Protocol(format!(
                    "no initiator is registered for protocol {protocol} at versions {:?}; \
                     registered initiators: {}",
                    descending(supported_versions),
                    describe(&self.initiator_for_version)
                ))
            },
        )
    }

    pub fn is_empty(&self) -> bool {
        self.initiator_protocols.is_empty() && self.responder_for_version.is_empty()
    }
}

fn descending(versions: &[u32]) -> Vec<u32> {
    let mut sorted = versions.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted
}

fn highest_match(
    table: &HashMap<ProtocolVersion, String>,
    protocol: &str,
    supported_versions: &[u32],
) -> Option<NegotiatedProtocol> {
    descending(supported_versions).into_iter().find_map(|version| {
        table
            .get(&ProtocolVersion::new(protocol, version))
            .map(|flow| NegotiatedProtocol {
                protocol: protocol.to_owned(),
                flow: flow.clone(),
                version,
            })
    })
}

fn describe(table: &HashMap<ProtocolVersion, String>) -> String {
    let mut pairs: Vec<_> = table.iter().map(|(pv, flow)| format!("{pv} -> {flow}")).collect();
    pairs.sort();
    format!("[{}]", pairs.join(", "))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
struct ResponderEntry {
    flow: String,
    protocol: String,
    versions: Vec<u32>,
    responder_flow: bool,
}

/// Collects flow declarations; [`build`](Self::build) validates them.
#[derive(Debug, Clone, Default)]
pub struct ProtocolCatalogBuilder {
    initiators: Vec<(String, ProtocolVersion)>,
    responders: Vec<ResponderEntry>,
}

impl ProtocolCatalogBuilder {
    /// Declare an initiating flow.  Returns `&mut Self` for chaining.
    pub fn initiator(&mut self, flow: &str, protocol: &str, versions: &[u32]) -> &mut Self {
        for v in versions {
            self.initiators
                .push((flow.to_owned(), ProtocolVersion::new(protocol, *v)));
        }
        self
    }

    /// Declare a responder flow.  `responder_flow` must be `true` for the
    /// declaration to build.
    pub fn responder(
        &mut self,
        flow: &str,
        protocol: &str,
        versions: &[u32],
        responder_flow: bool,
    ) -> &mut Self {
        self.responders.push(ResponderEntry {
            flow: flow.to_owned(),
            protocol: protocol.to_owned(),
            versions: versions.to_vec(),
            responder_flow,
        });
        self
    }

    pub fn build(&self) -> Result<ProtocolCatalog> {
        let mut catalog = ProtocolCatalog::default();

        for (flow, pv) in &self.initiators {
            catalog
                .initiator_protocols
                .entry(flow.clone())
                .or_default()
                .push(pv.clone());
            catalog
                .initiator_for_version
                .entry(pv.clone())
                .or_insert_with(|| flow.clone());
        }

        for resp in &self.responders {
            if !resp.responder_flow {
                return Err(Error::Protocol(format!(
                    "{} declares protocol {} but is not a responder flow",
                    resp.flow, resp.protocol
                )));
            }
            for v in &resp.versions {
                let key = ProtocolVersion::new(&resp.protocol, *v);
                if let Some(existing) = catalog.responder_for_version.get(&key) {
                    return Err(Error::Protocol(format!(
                        "cannot declare multiple responders for the same protocol: \
                         {key} is claimed by both {existing} and {}",
                        resp.flow
                    )));
                }
                catalog.responder_for_version.insert(key, resp.flow.clone());
            }
        }

        tracing::debug!(
            initiators = catalog.initiator_protocols.len(),
            responders = catalog.responder_for_version.len(),
            "protocol catalog built"
        );

        Ok(catalog)
    }
}
