//! Bus handlers binding bus traffic to the observer.

use std::sync::Arc;

use super::{ConnectionEdges, NetstateReporter, Observer, ThroughputMeter};
use crate::core::bus::{BusHandler, BusMessage};
use crate::core::state::TableRole;

/// Handler for the upstream direction (local or consumer traffic heading
/// out).
pub fn upstream_handler() -> BusHandler {
    Box::new(move |msg| {
        if let BusMessage::Chunk { payload, slot } = msg {
            tracing::trace!(bytes = payload.len(), slot, "upstream chunk");
        }
    })
}

/// Handler for the downstream direction (replies heading back to consumer
/// slots).
pub fn downstream_handler(observer: Arc<dyn Observer>, meter: Arc<ThroughputMeter>) -> BusHandler {
    Box::new(move |msg| {
        if let BusMessage::Chunk { payload, slot } = msg {
            meter.record(payload.len());
            observer.on_downstream_chunk(payload.len(), *slot);
        }
    })
}

/// Handler for the control channel: connection changes of both tables and
/// starvation reports. Consumer slots are reported on their up and down
/// edges only.
pub fn control_handler(observer: Arc<dyn Observer>, netstate: Option<NetstateReporter>) -> BusHandler {
    let mut edges = ConnectionEdges::default();
    Box::new(move |msg| match msg {
        BusMessage::ConnectionChange {
            table: TableRole::Consumer,
            state,
            slot,
            location,
        } => {
            let Some(signal) = edges.observe(*slot, *state) else {
                tracing::trace!(%state, slot, "consumer transition without an edge");
                return;
            };
            observer.on_consumer_connection_change(*state, *slot, location.as_deref());
            if let Some(netstate) = &netstate {
                netstate.report(signal, *slot, location.as_deref());
            }
        }
        BusMessage::ConnectionChange { table, state, slot, .. } => {
            tracing::trace!(%table, %state, slot, "connection change");
        }
        BusMessage::RoutingStarved { table, waited } => observer.on_routing_starved(*table, *waited),
        BusMessage::Chunk { .. } => {}
    })
}
