//! # Realtime Negotiation
//!
//! Drives one peer-to-peer negotiation attempt for the two realtime worker
//! kinds. The attempt runs in two budgeted phases:
//!
//! 1. **Rendezvous** (`NATFailTimeout`): fetch a batch of rendezvous servers
//!    from the [`CandidateSource`], open a [`PeerSession`] seeded with them,
//!    and trade session descriptions through the [`Signaling`] service.
//! 2. **Link** (`ICEFailTimeout`): let the session establish the link.
//!
//! First contact always goes through the genesis identity:
//!
//! ```text
//!  free peer (RealtimeProducer)         signaling          censored peer (RealtimeConsumer)
//!  Genesis{from: P, to: genesis} ──────►   ◄────── Discover{from: C, to: genesis}
//!                                          ──────► Genesis{from: P}
//!  ◄────── Offer{from: C, to: P}           ◄────── Offer{from: C, to: P, payload: offer}
//!  Answer{from: P, to: C} ─────────────►   ──────► Answer{from: P, payload: answer}
//! ```
//!
//! Every envelope carries the operator tag so the signaling service can
//! attribute sessions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Connector, Link};
use crate::configs::RealtimeOptions;
use crate::core::state::WorkerKind;
use crate::error::LinkError;

/// Pause range between two empty signaling polls.
const REPOLL_PAUSE_MS: std::ops::RangeInclusive<u64> = 50..=150;

/// Waits a jittered moment before polling the signaling service again.
async fn repoll_pause() {
    let pause = rand::rng().random_range(REPOLL_PAUSE_MS);
    tokio::time::sleep(Duration::from_millis(pause)).await;
}

/// Source of rendezvous-server addresses (e.g. `stun:host:port`).
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn batch(&self, size: u32) -> Result<Vec<String>, LinkError>;
}

/// A fixed candidate list, returned as-is (truncated to the batch size).
#[derive(Debug, Clone, Default)]
pub struct StaticCandidates(pub Vec<String>);

#[async_trait]
impl CandidateSource for StaticCandidates {
    async fn batch(&self, size: u32) -> Result<Vec<String>, LinkError> {
        Ok(self.0.iter().take(size as usize).cloned().collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// A free peer announcing itself on the genesis identity.
    Genesis,
    /// A censored peer asking the genesis identity for an announced peer.
    Discover,
    Offer,
    Answer,
}

/// One signaling message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: String,
    pub to: String,
    pub tag: String,
    pub kind: SignalKind,
    #[serde(default)]
    pub payload: String,
}

/// The discovery/signaling service.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Posts `envelope` and waits for the reply addressed to its sender, if
    /// the exchange has one.
    async fn exchange(&self, envelope: SignalEnvelope) -> Result<Option<SignalEnvelope>, LinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Offerer,
    Answerer,
}

/// The transport stack underneath a realtime link.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Opens a session seeded with the rendezvous servers.
    async fn open(&self, role: PeerRole, ice_servers: &[String]) -> Result<Box<dyn PeerSession>, LinkError>;
}

/// A session between opening and an established link.
#[async_trait]
pub trait PeerSession: Send {
    /// The description to hand to the remote peer.
    fn local_description(&self) -> String;

    async fn apply_remote(&mut self, description: &str) -> Result<(), LinkError>;

    async fn establish(self: Box<Self>) -> Result<Link, LinkError>;
}

/// Negotiation budgets and identities for one realtime connector.
#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    pub genesis_addr: String,
    pub tag: String,
    pub nat_fail_timeout: Duration,
    pub ice_fail_timeout: Duration,
    pub stun_batch_size: u32,
}

impl From<&RealtimeOptions> for RealtimeSettings {
    fn from(options: &RealtimeOptions) -> Self {
        Self {
            genesis_addr: options.genesis_addr.clone(),
            tag: options.tag.clone(),
            nat_fail_timeout: options.nat_fail_timeout(),
            ice_fail_timeout: options.ice_fail_timeout(),
            stun_batch_size: options.stun_batch_size,
        }
    }
}

pub struct RealtimeConnector {
    role: PeerRole,
    settings: RealtimeSettings,
    candidates: Arc<dyn CandidateSource>,
    signaling: Arc<dyn Signaling>,
    transport: Arc<dyn PeerTransport>,
}

impl RealtimeConnector {
    /// `kind` must be one of the realtime kinds; a free peer
    /// (`RealtimeProducer`) answers, a censored peer offers.
    pub fn new(
        kind: WorkerKind,
        settings: RealtimeSettings,
        candidates: Arc<dyn CandidateSource>,
        signaling: Arc<dyn Signaling>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let role = match kind {
            WorkerKind::RealtimeProducer => PeerRole::Answerer,
            _ => PeerRole::Offerer,
        };
        Self {
            role,
            settings,
            candidates,
            signaling,
            transport,
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    fn envelope(&self, from: &str, to: &str, kind: SignalKind, payload: String) -> SignalEnvelope {
        SignalEnvelope {
            from: from.to_string(),
            to: to.to_string(),
            tag: self.settings.tag.clone(),
            kind,
            payload,
        }
    }

    /// Phase 1: candidates, session, description exchange.
    async fn rendezvous(&self, slot: usize, me: &str) -> Result<Box<dyn PeerSession>, LinkError> {
        let ice_servers = self.candidates.batch(self.settings.stun_batch_size).await?;
        tracing::debug!(slot, servers = ice_servers.len(), "rendezvous candidates fetched");
        let mut session = self.transport.open(self.role, &ice_servers).await?;

        match self.role {
            PeerRole::Answerer => {
                let offer = loop {
                    let announce = self.envelope(me, &self.settings.genesis_addr, SignalKind::Genesis, String::new());
                    match self.signaling.exchange(announce).await? {
                        Some(reply) if reply.kind == SignalKind::Offer => break reply,
                        Some(other) => {
                            return Err(LinkError::Signaling(format!("expected offer, got {:?}", other.kind)));
                        }
                        // Nobody picked up the announcement yet; announce again.
                        None => repoll_pause().await,
                    }
                };
                session.apply_remote(&offer.payload).await?;
                let answer = self.envelope(me, &offer.from, SignalKind::Answer, session.local_description());
                self.signaling.exchange(answer).await?;
            }
            PeerRole::Offerer => {
                let genesis = loop {
                    let discover = self.envelope(me, &self.settings.genesis_addr, SignalKind::Discover, String::new());
                    match self.signaling.exchange(discover).await? {
                        Some(reply) if reply.kind == SignalKind::Genesis => break reply,
                        Some(other) => {
                            return Err(LinkError::Signaling(format!("expected genesis, got {:?}", other.kind)));
                        }
                        None => repoll_pause().await,
                    }
                };
                let offer = self.envelope(me, &genesis.from, SignalKind::Offer, session.local_description());
                match self.signaling.exchange(offer).await? {
                    Some(answer) if answer.kind == SignalKind::Answer => {
                        session.apply_remote(&answer.payload).await?;
                    }
                    Some(other) => {
                        return Err(LinkError::Rejected(format!("peer replied with {:?}", other.kind)));
                    }
                    None => return Err(LinkError::Rejected(format!("peer {} never answered", genesis.from))),
                }
            }
        }
        Ok(session)
    }
}

#[async_trait]
impl Connector for RealtimeConnector {
    async fn connect(&self, slot: usize) -> Result<Link, LinkError> {
        let me = Uuid::new_v4().to_string();
        let nat = self.settings.nat_fail_timeout;
        let ice = self.settings.ice_fail_timeout;

        let session = tokio::time::timeout(nat, self.rendezvous(slot, &me))
            .await
            .map_err(|_| LinkError::Timeout {
                stage: "rendezvous",
                after: nat,
            })??;

        let link = tokio::time::timeout(ice, session.establish())
            .await
            .map_err(|_| LinkError::Timeout {
                stage: "link establishment",
                after: ice,
            })??;

        tracing::info!(slot, peer = %me, location = ?link.location, "realtime link established");
        Ok(link)
    }
}
