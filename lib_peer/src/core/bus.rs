//! # Event Bus
//!
//! Two bounded FIFO directions connect the consumer-side router with the
//! producer-side router and with the observer layer:
//!
//! ```text
//!                 upstream ingress ──► drain ──► handler ──► upstream egress
//!  consumer side  ─────────────────────────────────────────────────────────►  producer side
//!                 ◄─────────────────────────────────────────────────────────
//!                 downstream egress ◄── handler ◄── drain ◄── downstream ingress
//! ```
//!
//! Each direction is drained by its own task which calls the bound handler
//! for every message, in arrival order, and then forwards data chunks to
//! the egress channel. Both channels hold at most `busBufferSz` messages;
//! a sender facing a full channel waits. Nothing is ever dropped for lack
//! of space.
//!
//! Connection changes and starvation reports travel on a separate control
//! channel with its own handler. That channel is unbounded: a saturated data
//! direction never stalls a worker state machine, and no state edge is lost
//! to a full queue. Its volume is bounded by worker transitions, which are
//! paced by negotiation timeouts and retry backoff.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::state::{TableRole, WorkerState};

/// One message on either direction of the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    /// Application data. `slot` is the consumer-table slot the data came
    /// from (upstream) or must be delivered to (downstream).
    Chunk { payload: Bytes, slot: usize },
    /// A worker changed state.
    ConnectionChange {
        table: TableRole,
        state: WorkerState,
        slot: usize,
        location: Option<String>,
    },
    /// A router has been holding data with no usable slot.
    RoutingStarved { table: TableRole, waited: Duration },
}

impl BusMessage {
    pub fn chunk(payload: Bytes, slot: usize) -> Self {
        Self::Chunk { payload, slot }
    }
}

/// Called once per message, in channel order. Must not block.
pub type BusHandler = Box<dyn FnMut(&BusMessage) + Send + 'static>;

/// Sends connection changes and starvation reports. Never waits.
pub type ControlSender = mpsc::UnboundedSender<BusMessage>;

/// The handlers bound to the bus, one per channel.
pub struct BusHandlers {
    pub upstream: BusHandler,
    pub downstream: BusHandler,
    pub control: BusHandler,
}

/// The channel ends one router side owns.
#[derive(Debug)]
pub struct BusSide {
    /// Into this side's outbound direction.
    pub tx: mpsc::Sender<BusMessage>,
    /// Chunks arriving from the other side.
    pub rx: mpsc::Receiver<BusMessage>,
    /// Into the control channel.
    pub control: ControlSender,
}

struct Control {
    rx: mpsc::UnboundedReceiver<BusMessage>,
    handler: BusHandler,
}

impl Control {
    async fn drain(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => (self.handler)(&msg),
                    None => break,
                },
            }
        }
        tracing::debug!(direction = "control", "bus drain stopped");
    }
}

struct Direction {
    name: &'static str,
    ingress: mpsc::Receiver<BusMessage>,
    egress: mpsc::Sender<BusMessage>,
    handler: BusHandler,
}

impl Direction {
    async fn drain(mut self, shutdown: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = self.ingress.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            (self.handler)(&msg);
            if let BusMessage::Chunk { .. } = msg {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    sent = self.egress.send(msg) => {
                        if sent.is_err() {
                            tracing::debug!(direction = self.name, "bus egress closed");
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!(direction = self.name, "bus drain stopped");
    }
}

/// The bounded bidirectional bus.
pub struct EventBus {
    capacity: usize,
    upstream: Option<Direction>,
    downstream: Option<Direction>,
    control: Option<Control>,
}

impl EventBus {
    /// Builds both directions with `capacity` slots per channel, plus the
    /// control channel, and returns the bus with the consumer-side and
    /// producer-side ends.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; options validation rejects that first.
    pub fn new(capacity: usize, handlers: BusHandlers) -> (Self, BusSide, BusSide) {
        let (up_in_tx, up_in_rx) = mpsc::channel(capacity);
        let (up_out_tx, up_out_rx) = mpsc::channel(capacity);
        let (down_in_tx, down_in_rx) = mpsc::channel(capacity);
        let (down_out_tx, down_out_rx) = mpsc::channel(capacity);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let bus = Self {
            capacity,
            upstream: Some(Direction {
                name: "upstream",
                ingress: up_in_rx,
                egress: up_out_tx,
                handler: handlers.upstream,
            }),
            downstream: Some(Direction {
                name: "downstream",
                ingress: down_in_rx,
                egress: down_out_tx,
                handler: handlers.downstream,
            }),
            control: Some(Control {
                rx: control_rx,
                handler: handlers.control,
            }),
        };
        let consumer_side = BusSide {
            tx: up_in_tx,
            rx: down_out_rx,
            control: control_tx.clone(),
        };
        let producer_side = BusSide {
            tx: down_in_tx,
            rx: up_out_rx,
            control: control_tx,
        };
        (bus, consumer_side, producer_side)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Starts draining both directions and the control channel. Calling it
    /// again does nothing.
    pub fn start(&mut self, handle: &Handle, shutdown: &CancellationToken) {
        for direction in [self.upstream.take(), self.downstream.take()].into_iter().flatten() {
            handle.spawn(direction.drain(shutdown.clone()));
        }
        if let Some(control) = self.control.take() {
            handle.spawn(control.drain(shutdown.clone()));
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("started", &self.upstream.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (BusHandler, Arc<Mutex<Vec<BusMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Box::new(move |m: &BusMessage| sink.lock().unwrap().push(m.clone())), seen)
    }

    fn handlers(upstream: BusHandler, downstream: BusHandler) -> BusHandlers {
        BusHandlers {
            upstream,
            downstream,
            control: Box::new(|_| {}),
        }
    }

    fn active(slot: usize) -> BusMessage {
        BusMessage::ConnectionChange {
            table: TableRole::Consumer,
            state: WorkerState::Active,
            slot,
            location: None,
        }
    }

    #[tokio::test]
    async fn directions_preserve_order_and_only_forward_chunks() {
        let (up, up_seen) = recorder();
        let (down, _) = recorder();
        let (mut bus, consumer, mut producer) = EventBus::new(8, handlers(up, down));
        let shutdown = CancellationToken::new();
        bus.start(&Handle::current(), &shutdown);

        for i in 0..3u8 {
            consumer.tx.send(BusMessage::chunk(Bytes::from(vec![i]), 0)).await.unwrap();
        }
        consumer.tx.send(active(0)).await.unwrap();
        consumer.tx.send(BusMessage::chunk(Bytes::from_static(b"x"), 0)).await.unwrap();

        let mut out = Vec::new();
        for _ in 0..4 {
            match producer.rx.recv().await.unwrap() {
                BusMessage::Chunk { payload, .. } => out.push(payload),
                other => panic!("non-chunk forwarded: {other:?}"),
            }
        }
        assert_eq!(out, vec![Bytes::from(vec![0]), Bytes::from(vec![1]), Bytes::from(vec![2]), Bytes::from_static(b"x")]);
        assert_eq!(up_seen.lock().unwrap().len(), 5);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn full_direction_blocks_the_sender() {
        let (up, _) = recorder();
        let (down, _) = recorder();
        let (mut bus, consumer, mut producer) = EventBus::new(1, handlers(up, down));
        let shutdown = CancellationToken::new();
        bus.start(&Handle::current(), &shutdown);

        // One message parked in egress, one held by the drain task, one in
        // ingress; the next send has nowhere to go.
        for i in 0..3u8 {
            consumer.tx.send(BusMessage::chunk(Bytes::from(vec![i]), 0)).await.unwrap();
        }
        tokio::task::yield_now().await;
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            consumer.tx.send(BusMessage::chunk(Bytes::from_static(b"late"), 0)),
        )
        .await;
        assert!(blocked.is_err(), "send into a full bus must wait");

        assert!(producer.rx.recv().await.is_some());
        tokio::time::timeout(
            Duration::from_secs(1),
            consumer.tx.send(BusMessage::chunk(Bytes::from_static(b"late"), 0)),
        )
        .await
        .expect("space freed")
        .unwrap();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn control_messages_pass_a_saturated_bus() {
        let (control, control_seen) = recorder();
        let (mut bus, consumer, _producer) = EventBus::new(
            1,
            BusHandlers {
                upstream: Box::new(|_| {}),
                downstream: Box::new(|_| {}),
                control,
            },
        );
        let shutdown = CancellationToken::new();
        bus.start(&Handle::current(), &shutdown);

        for i in 0..3u8 {
            consumer.tx.send(BusMessage::chunk(Bytes::from(vec![i]), 0)).await.unwrap();
        }
        for slot in 0..50 {
            consumer.control.send(active(slot)).unwrap();
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while control_seen.lock().unwrap().len() < 50 && tokio::time::Instant::now() < deadline {
            tokio::task::yield_now().await;
        }
        let seen = control_seen.lock().unwrap().clone();
        assert_eq!(seen, (0..50).map(active).collect::<Vec<_>>());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn downstream_mirrors_upstream() {
        let (down, down_seen) = recorder();
        let (mut bus, mut consumer, producer) = EventBus::new(4, handlers(Box::new(|_| {}), down));
        let shutdown = CancellationToken::new();
        bus.start(&Handle::current(), &shutdown);
        bus.start(&Handle::current(), &shutdown);

        producer.tx.send(BusMessage::chunk(Bytes::from_static(b"reply"), 3)).await.unwrap();
        assert_eq!(
            consumer.rx.recv().await,
            Some(BusMessage::chunk(Bytes::from_static(b"reply"), 3))
        );
        assert_eq!(down_seen.lock().unwrap().len(), 1);
        shutdown.cancel();
    }
}
