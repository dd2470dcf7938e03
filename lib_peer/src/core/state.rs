//! Worker states, kinds and table roles.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one worker slot.
///
/// ```text
/// Idle -> Negotiating -> Connected -> Active -> Failing -> Negotiating ...
///              \              \          \          \
///               +--------------+----------+----------+--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Constructed, not started in the current boot cycle.
    Idle,
    /// Establishing the underlying link.
    Negotiating,
    /// Link established; the worker is about to hand it to its router.
    Connected,
    /// Link usable; the router may read and write through the slot.
    Active,
    /// Link lost or negotiation failed; waiting out the backoff.
    Failing,
    /// Terminal for the current boot cycle.
    Closed,
}

impl WorkerState {
    /// Legal transitions of the worker state machine.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Idle, Negotiating)
                | (Closed, Negotiating)
                | (Negotiating, Connected)
                | (Negotiating, Failing)
                | (Connected, Active)
                | (Connected, Failing)
                | (Active, Failing)
                | (Failing, Negotiating)
                | (Idle, Closed)
                | (Negotiating, Closed)
                | (Connected, Closed)
                | (Active, Closed)
                | (Failing, Closed)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Negotiating => write!(f, "negotiating"),
            Self::Connected => write!(f, "connected"),
            Self::Active => write!(f, "active"),
            Self::Failing => write!(f, "failing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// How a worker establishes its link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    /// Byte stream to the local application through the proxy endpoint.
    LocalStream,
    /// Realtime peer link offered to a censored peer (free peer side).
    RealtimeProducer,
    /// Realtime peer link obtained from a free peer (censored peer side).
    RealtimeConsumer,
    /// WebSocket to the relay/egress service.
    RelayConsumer,
}

impl WorkerKind {
    /// Kinds whose state changes are reported as consumer connection changes.
    pub fn faces_consumers(&self) -> bool {
        matches!(self, Self::LocalStream | Self::RealtimeProducer)
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalStream => write!(f, "local_stream"),
            Self::RealtimeProducer => write!(f, "realtime_producer"),
            Self::RealtimeConsumer => write!(f, "realtime_consumer"),
            Self::RelayConsumer => write!(f, "relay_consumer"),
        }
    }
}

/// Which side of the bus a table sits on.
///
/// The consumer table faces whoever consumes connectivity (the local
/// application, or censored peers when sharing); the producer table faces
/// whoever produces it (free peers, or the relay).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableRole {
    Consumer,
    Producer,
}

impl fmt::Display for TableRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consumer => write!(f, "consumer"),
            Self::Producer => write!(f, "producer"),
        }
    }
}

/// Why a slot's readiness signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// First Connected of the boot cycle.
    Connected,
    /// Closed before ever connecting (stopped, or retries exhausted).
    Closed,
}
