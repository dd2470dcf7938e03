//! # Observer Layer
//!
//! The core reports to the outside world through the [`Observer`] trait.
//! Calls arrive from bus drain tasks and timers; implementations must return
//! quickly and must not block, since a slow observer throttles the bus
//! direction that calls it.
//!
//! ## Contained Modules:
//!
//! - **`handlers`**: the bus handlers that turn bus traffic into observer
//!   calls.
//! - **`throughput`**: byte counting and the periodic throughput ticker.
//! - **`netstate`**: optional reporting of consumer connection changes to a
//!   network-state collector.

use std::time::Duration;

use crate::core::state::{TableRole, WorkerState};

pub mod handlers;
pub mod netstate;
pub mod throughput;

pub use handlers::{control_handler, downstream_handler, upstream_handler};
pub use netstate::NetstateReporter;
pub use throughput::ThroughputMeter;

/// Notifications emitted by the engine.
pub trait Observer: Send + Sync {
    /// The engine is ready: fired once after boot and once after every
    /// completed stop.
    fn on_ready(&self) {}

    /// Boot finished; tables may be started.
    fn on_startup(&self) {}

    /// `size` bytes were delivered downstream to consumer slot `slot`.
    fn on_downstream_chunk(&self, _size: usize, _slot: usize) {}

    /// Downstream throughput over the last refresh period.
    fn on_downstream_throughput(&self, _bytes_per_sec: u64) {}

    /// A consumer-table slot came up ([`WorkerState::Active`]) or went down
    /// ([`WorkerState::Failing`] or [`WorkerState::Closed`] after being
    /// `Active`). Ups and downs of a slot alternate.
    fn on_consumer_connection_change(&self, _state: WorkerState, _slot: usize, _location: Option<&str>) {}

    /// A router has been holding data with no usable slot for `waited`.
    fn on_routing_starved(&self, _table: TableRole, _waited: Duration) {}
}

/// Writes every notification as a tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_ready(&self) {
        tracing::info!("engine ready");
    }

    fn on_startup(&self) {
        tracing::info!("engine started up");
    }

    fn on_downstream_chunk(&self, size: usize, slot: usize) {
        tracing::trace!(size, slot, "downstream chunk");
    }

    fn on_downstream_throughput(&self, bytes_per_sec: u64) {
        if bytes_per_sec > 0 {
            tracing::debug!(bytes_per_sec, "downstream throughput");
        }
    }

    fn on_consumer_connection_change(&self, state: WorkerState, slot: usize, location: Option<&str>) {
        tracing::info!(%state, slot, location = location.unwrap_or("-"), "consumer connection changed");
    }

    fn on_routing_starved(&self, table: TableRole, waited: Duration) {
        tracing::warn!(%table, ?waited, "routing starved");
    }
}

/// Last reported edge of every consumer slot.
///
/// A slot goes up when it becomes [`WorkerState::Active`] and down only when
/// it leaves `Active`. Failed negotiations of a slot that never came up are
/// not edges, so ups and downs always pair.
#[derive(Debug, Clone, Default)]
pub struct ConnectionEdges {
    up: Vec<bool>,
}

impl ConnectionEdges {
    /// `1` when `slot` came up, `-1` when it went down, `None` otherwise.
    pub fn observe(&mut self, slot: usize, state: WorkerState) -> Option<i8> {
        if self.up.len() <= slot {
            self.up.resize(slot + 1, false);
        }
        let now = state == WorkerState::Active;
        let was = std::mem::replace(&mut self.up[slot], now);
        match (was, now) {
            (false, true) => Some(1),
            (true, false) => Some(-1),
            _ => None,
        }
    }
}
