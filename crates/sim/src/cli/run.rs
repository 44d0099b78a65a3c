//! `flowmesh-sim run`: an initiator and a responder node on two tokio tasks,
//! linked by unbounded mpsc channels.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;

use fm_domain::config::Config;
use fm_protocol::{HoldingIdentity, SessionEvent, SessionPayload};
use fm_sessions::{counterparty_session_id, SessionInfo, SessionStatus, StaticSandboxResolver};

use crate::node::Node;

const GROUP: &str = "flowmesh-sim";
const DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub sessions: u32,
    pub messages: u32,
    pub require_close: bool,
    pub send_init_immediately: bool,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub protocol_flow: String,
    pub initiator: BTreeMap<String, SessionStatus>,
    pub responder: BTreeMap<String, SessionStatus>,
    pub echoes_received: u32,
}

/// One direction of the wire.  Session ids are flipped to the receiver's
/// form on the way through.
struct Link {
    tx: mpsc::UnboundedSender<Vec<SessionEvent>>,
    suffix: String,
}

impl Link {
    fn ship(&self, from: &str, events: Vec<SessionEvent>) {
        if events.is_empty() {
            return;
        }
        let batch: Vec<SessionEvent> = events
            .into_iter()
            .map(|mut e| {
                e.session_id = counterparty_session_id(&e.session_id, &self.suffix);
                e
            })
            .collect();
        let count = batch.len();
        if self.tx.send(batch).is_err() {
            tracing::debug!(from, count, "peer already finished, batch dropped");
        }
    }
}

pub async fn run(config: Config, opts: RunOptions) -> anyhow::Result<RunSummary> {
    let initiator_flow = config
        .protocols
        .initiators
        .first()
        .map(|d| d.flow.clone())
        .context("no initiator flow declared in [protocols]")?;
    let responder_flow = config
        .protocols
        .responders
        .first()
        .map(|d| d.flow.clone())
        .context("no responder flow declared in [protocols]")?;
    let bundle_hashes = config
        .deployments
        .first()
        .map(|d| d.bundle_hashes.clone())
        .context("no [[deployments]] configured")?;

    let resolver = Arc::new(StaticSandboxResolver::from_config(&config)?);
    let suffix = config.sessions.initiated_suffix.clone();

    let alice = Node::new(
        HoldingIdentity::new("O=Alice, L=London, C=GB", GROUP),
        &initiator_flow,
        true,
        bundle_hashes.clone(),
        &config,
        resolver.clone(),
    );
    let bob = Node::new(
        HoldingIdentity::new("O=Bob, L=Paris, C=FR", GROUP),
        &responder_flow,
        false,
        bundle_hashes,
        &config,
        resolver,
    );

    let (to_bob, bob_rx) = mpsc::unbounded_channel();
    let (to_alice, alice_rx) = mpsc::unbounded_channel();
    let alice_link = Link {
        tx: to_bob,
        suffix: suffix.clone(),
    };
    let bob_link = Link { tx: to_alice, suffix };

    let bob_task = tokio::spawn(responder(bob, bob_rx, bob_link, opts.messages));
    let alice_task = tokio::spawn(initiator(alice, alice_rx, alice_link, opts));

    let (alice_result, bob_result) = tokio::time::timeout(DEADLINE, async {
        let alice = alice_task.await;
        let bob = bob_task.await;
        (alice, bob)
    })
    .await
    .context("simulation did not finish in time")?;

    let (initiator, echoes_received) = alice_result.context("initiator task panicked")??;
    let responder = bob_result.context("responder task panicked")??;

    Ok(RunSummary {
        protocol_flow: format!("{initiator_flow} -> {responder_flow}"),
        initiator,
        responder,
        echoes_received,
    })
}

async fn initiator(
    mut node: Node,
    mut rx: mpsc::UnboundedReceiver<Vec<SessionEvent>>,
    link: Link,
    opts: RunOptions,
) -> anyhow::Result<(BTreeMap<String, SessionStatus>, u32)> {
    let now = Utc::now();
    let peer = HoldingIdentity::new("O=Bob, L=Paris, C=FR", GROUP);
    let infos: Vec<SessionInfo> = (0..opts.sessions)
        .map(|_| {
            SessionInfo::new(uuid::Uuid::new_v4().to_string(), peer.clone())
                .require_close(opts.require_close)
        })
        .collect();

    node.open(&infos, opts.send_init_immediately, now)?;
    for info in &infos {
        for n in 0..opts.messages {
            node.send(&info.session_id, format!("hello #{n}").into_bytes(), now)?;
        }
    }
    link.ship("initiator", node.outbox(now));

    let mut echoes: HashMap<String, u32> = HashMap::new();
    let mut total = 0;
    while !node.all_terminal() {
        let Some(batch) = rx.recv().await else {
            anyhow::bail!("responder hung up with sessions still open");
        };
        let now = Utc::now();
        for event in batch {
            node.deliver(event, now)?;
        }

        for (session_id, payload) in node.drain()? {
            match payload {
                SessionPayload::Data { payload } => {
                    total += 1;
                    let seen = echoes.entry(session_id.clone()).or_default();
                    *seen += 1;
                    tracing::debug!(
                        session_id = %session_id,
                        echo = %String::from_utf8_lossy(&payload),
                        "echo received"
                    );
                    if *seen == opts.messages {
                        node.close(&[session_id], now)?;
                    }
                }
                SessionPayload::Close
                    if node.status(&session_id) == Some(SessionStatus::Closing) =>
                {
                    node.close(&[session_id], now)?;
                }
                _ => {}
            }
        }
        link.ship("initiator", node.outbox(now));
    }

    tracing::info!(sessions = infos.len(), echoes = total, "initiator finished");
    Ok((node.statuses(), total))
}

async fn responder(
    mut node: Node,
    mut rx: mpsc::UnboundedReceiver<Vec<SessionEvent>>,
    link: Link,
    messages: u32,
) -> anyhow::Result<BTreeMap<String, SessionStatus>> {
    let mut served: HashMap<String, u32> = HashMap::new();

    while let Some(batch) = rx.recv().await {
        let now = Utc::now();
        for event in batch {
            node.deliver(event, now)?;
        }

        for (session_id, payload) in node.drain()? {
            let SessionPayload::Data { payload } = payload else {
                continue;
            };
            let mut echo = b"echo: ".to_vec();
            echo.extend_from_slice(&payload);
            node.send(&session_id, echo, now)?;

            let count = served.entry(session_id.clone()).or_default();
            *count += 1;
            if *count == messages {
                node.close(&[session_id], now)?;
            }
        }
        link.ship("responder", node.outbox(now));
    }

    tracing::info!(sessions = served.len(), "responder finished");
    Ok(node.statuses())
}

/// Render the summary as an aligned table.
pub fn print_summary(summary: &RunSummary) {
    println!("protocol: {}", summary.protocol_flow);
    println!("echoes received: {}", summary.echoes_received);
    println!("{:<40} status", "initiator session");
    for (id, status) in &summary.initiator {
        println!("{id:<40} {}", status.as_str());
    }
    println!("{:<40} status", "responder session");
    for (id, status) in &summary.responder {
        println!("{id:<40} {}", status.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::with_demo_protocols;

    fn opts(require_close: bool, send_init_immediately: bool) -> RunOptions {
        RunOptions {
            sessions: 3,
            messages: 2,
            require_close,
            send_init_immediately,
        }
    }

    fn assert_all_closed(summary: &RunSummary) {
        assert_eq!(summary.initiator.len(), 3);
        assert_eq!(summary.responder.len(), 3);
        assert!(summary.initiator.values().all(|s| *s == SessionStatus::Closed));
        assert!(summary.responder.values().all(|s| *s == SessionStatus::Closed));
        assert_eq!(summary.echoes_received, 6);
    }

    #[tokio::test]
    async fn full_handshake_closes_everything() {
        let config = with_demo_protocols(Config::default()).unwrap();
        let summary = run(config, opts(true, true)).await.unwrap();
        assert_all_closed(&summary);
        assert!(summary.responder.keys().all(|id| id.ends_with("-INITIATED")));
    }

    #[tokio::test]
    async fn one_shot_sessions_with_deferred_init() {
        let config = with_demo_protocols(Config::default()).unwrap();
        let summary = run(config, opts(false, false)).await.unwrap();
        assert_all_closed(&summary);
    }

    #[tokio::test]
    async fn missing_deployment_is_reported() {
        let mut config = with_demo_protocols(Config::default()).unwrap();
        config.deployments.clear();
        let err = run(config, opts(true, true)).await.unwrap_err();
        assert!(err.to_string().contains("deployments"));
    }
}
