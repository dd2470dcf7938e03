//! # Table Routers
//!
//! A router sits between one side of the [`EventBus`](super::bus::EventBus)
//! and one [`WorkerTable`](super::table::WorkerTable). It reads and writes
//! through slot ports only and never drives a worker's state.
//!
//! ## Disciplines
//!
//! - **[`ConsumerRouter`]**: consumer tables. Every slot's inbound bytes go
//!   upstream tagged with the slot index; downstream chunks are written to
//!   the slot they name.
//! - **[`SerialRouter`]**: one producer slot bound per lane, failing over to
//!   the lowest-indexed usable slot.
//! - **[`PoolRouter`]**: every usable producer slot shares the load, least
//!   recently used first, each slot serving one consumer slot at a time.
//!
//! A unit that cannot be written is never dropped because of one bad slot:
//! the router re-selects and retries. When no slot is usable the unit is
//! held, which stalls the bus direction behind it and applies backpressure
//! all the way to the sender. A hold that outlasts the starvation threshold
//! is reported on the bus's control channel.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::bus::{BusMessage, ControlSender};
use super::state::TableRole;
use super::table::WorkerTable;
use crate::configs::Discipline;
use crate::error::RouterError;

pub mod consumer;
pub mod pool;
pub mod serial;

pub use consumer::ConsumerRouter;
pub use pool::PoolRouter;
pub use serial::SerialRouter;

/// Common surface of the three disciplines.
pub trait TableRouter: Send + Sync {
    fn discipline(&self) -> Discipline;

    /// Starts moving data. Fails if the table's slot readers are already
    /// claimed, or if called twice.
    fn init(&mut self) -> Result<(), RouterError>;

    /// Current slot bindings: per lane for the serial discipline, the
    /// consumer slot that holds each producer slot for the pool discipline,
    /// empty for consumer routers.
    fn bindings(&self) -> Vec<Option<usize>>;
}

/// Runtime plumbing shared by every router of an engine.
#[derive(Debug, Clone)]
pub struct RouterContext {
    pub handle: Handle,
    /// Cancelled when the engine is dropped.
    pub shutdown: CancellationToken,
    pub starvation_threshold: Duration,
}

/// Reports holds that outlast the threshold.
#[derive(Debug, Clone)]
pub(crate) struct Starvation {
    pub(crate) table: TableRole,
    pub(crate) threshold: Duration,
    pub(crate) report: ControlSender,
}

impl Starvation {
    fn report(&self, waited: Duration) {
        tracing::warn!(table = %self.table, ?waited, "no usable slot, routing starved");
        let msg = BusMessage::RoutingStarved {
            table: self.table,
            waited,
        };
        if self.report.send(msg).is_err() {
            tracing::trace!(table = %self.table, "bus gone, starvation not reported");
        }
    }
}

/// A pulse marked changed on every transition of either table.
pub(crate) fn joint_pulse(a: &WorkerTable, b: &WorkerTable, ctx: &RouterContext) -> watch::Receiver<()> {
    let (tx, rx) = watch::channel(());
    let (mut a, mut b) = (a.subscribe(), b.subscribe());
    let shutdown = ctx.shutdown.clone();
    ctx.handle.spawn(async move {
        loop {
            let changed = tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = a.changed() => changed,
                changed = b.changed() => changed,
            };
            if changed.is_err() || tx.send(()).is_err() {
                break;
            }
        }
    });
    rx
}

/// Waits on table transitions until `pick` yields a slot.
///
/// Returns `None` on shutdown, or, with `give_up`, once the starvation
/// threshold has passed.
pub(crate) async fn hold_for_slot<F>(
    pulse: &mut watch::Receiver<()>,
    shutdown: &CancellationToken,
    starvation: &Starvation,
    give_up: bool,
    mut pick: F,
) -> Option<usize>
where
    F: FnMut() -> Option<usize>,
{
    let started = Instant::now();
    let deadline = started + starvation.threshold;
    let mut reported = false;
    loop {
        pulse.borrow_and_update();
        if let Some(slot) = pick() {
            if reported {
                tracing::info!(table = %starvation.table, slot, waited = ?started.elapsed(), "routing resumed");
            }
            return Some(slot);
        }
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            changed = pulse.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            _ = tokio::time::sleep_until(deadline), if !reported => {
                reported = true;
                starvation.report(started.elapsed());
                if give_up {
                    return None;
                }
            }
        }
    }
}
