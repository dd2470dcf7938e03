//! # Worker Table
//!
//! A fixed-size, ordered bank of workers of one kind and one directional
//! role. The table owns the workers; routers only see the per-slot ports
//! (state, write queue, inbound bytes) exposed here.
//!
//! ## Boot cycles
//!
//! [`WorkerTable::start`] opens a boot cycle: every slot gets its own task,
//! its own one-shot readiness signal, and a shared cancellation token.
//! [`WorkerTable::stop`] cancels the token and returns at once. The
//! signals of the current cycle are aggregated by [`WorkerTable::settled`]
//! into a single future, and [`WorkerTable::drained`] resolves once every
//! task of the cycle has exited. A later `start` opens a fresh cycle on the
//! same slots.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::future::{join_all, FutureExt, Shared};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::bus::ControlSender;
use super::lock;
use super::state::{Readiness, TableRole, WorkerKind, WorkerState};
use super::worker::{RetryPolicy, Worker, WorkerIo, WriteRequest};
use crate::error::RouterError;
use crate::transports::Connector;

/// Depth of each slot's inbound byte queue.
const INBOUND_DEPTH: usize = 64;

/// Router-facing ports of one slot.
struct SlotPorts {
    writer: mpsc::Sender<WriteRequest>,
    reader: Mutex<Option<mpsc::Receiver<Bytes>>>,
    state: watch::Receiver<WorkerState>,
}

struct Cycle {
    cancel: CancellationToken,
    readiness: Vec<Shared<oneshot::Receiver<Readiness>>>,
    tracker: TaskTracker,
}

/// Everything a table needs besides its connector.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub role: TableRole,
    pub kind: WorkerKind,
    pub size: usize,
    pub policy: RetryPolicy,
}

pub struct WorkerTable {
    role: TableRole,
    kind: WorkerKind,
    workers: Vec<Arc<Worker>>,
    ports: Vec<SlotPorts>,
    pulse: Arc<watch::Sender<()>>,
    handle: Handle,
    cycle: Mutex<Option<Cycle>>,
}

impl WorkerTable {
    /// Builds `spec.size` idle slots. `events` receives a connection change
    /// for every worker transition.
    pub fn new(
        spec: TableSpec,
        connector: Arc<dyn Connector>,
        events: Option<ControlSender>,
        handle: Handle,
    ) -> Self {
        let (pulse, _) = watch::channel(());
        let pulse = Arc::new(pulse);
        let mut workers = Vec::with_capacity(spec.size);
        let mut ports = Vec::with_capacity(spec.size);

        for index in 0..spec.size {
            let (writer, writes) = mpsc::channel(1);
            let (inbound, reader) = mpsc::channel(INBOUND_DEPTH);
            let (state, state_rx) = watch::channel(WorkerState::Idle);
            workers.push(Arc::new(Worker {
                index,
                table: spec.role,
                kind: spec.kind,
                connector: connector.clone(),
                policy: spec.policy,
                io: Arc::new(tokio::sync::Mutex::new(WorkerIo { writes, inbound })),
                state,
                pulse: pulse.clone(),
                events: events.clone(),
            }));
            ports.push(SlotPorts {
                writer,
                reader: Mutex::new(Some(reader)),
                state: state_rx,
            });
        }

        Self {
            role: spec.role,
            kind: spec.kind,
            workers,
            ports,
            pulse,
            handle,
            cycle: Mutex::new(None),
        }
    }

    /// Fixed slot count.
    pub fn size(&self) -> usize {
        self.ports.len()
    }

    pub fn role(&self) -> TableRole {
        self.role
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Launches every slot's negotiation. Does nothing while a cycle is
    /// already running.
    pub fn start(&self) {
        let mut cycle = lock(&self.cycle);
        if cycle.as_ref().is_some_and(|c| !c.cancel.is_cancelled()) {
            tracing::debug!(table = %self.role, "table already started");
            return;
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut readiness = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            let (ready_tx, ready_rx) = oneshot::channel();
            readiness.push(ready_rx.shared());
            tracker.spawn_on(worker.clone().run(cancel.clone(), ready_tx), &self.handle);
        }
        tracker.close();
        tracing::info!(table = %self.role, kind = %self.kind, slots = self.workers.len(), "table started");

        *cycle = Some(Cycle {
            cancel,
            readiness,
            tracker,
        });
    }

    /// Requests every slot to close and returns immediately. Idempotent.
    pub fn stop(&self) {
        if let Some(cycle) = lock(&self.cycle).as_ref() {
            if !cycle.cancel.is_cancelled() {
                tracing::info!(table = %self.role, "table stopping");
                cycle.cancel.cancel();
            }
        }
    }

    /// Resolves once every slot of the current cycle has fired its
    /// readiness signal. Resolves to an empty list if the table was never
    /// started.
    pub fn settled(&self) -> impl std::future::Future<Output = Vec<(usize, Readiness)>> + Send + 'static {
        let signals = lock(&self.cycle)
            .as_ref()
            .map(|c| c.readiness.clone())
            .unwrap_or_default();
        async move {
            join_all(signals)
                .await
                .into_iter()
                .enumerate()
                .map(|(slot, fired)| (slot, fired.unwrap_or(Readiness::Closed)))
                .collect()
        }
    }

    /// Resolves once every task of the current cycle has exited.
    pub fn drained(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let tracker = lock(&self.cycle).as_ref().map(|c| c.tracker.clone());
        async move {
            if let Some(tracker) = tracker {
                tracker.wait().await;
            }
        }
    }

    pub fn state(&self, slot: usize) -> Option<WorkerState> {
        self.ports.get(slot).map(|p| *p.state.borrow())
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.ports.iter().map(|p| *p.state.borrow()).collect()
    }

    /// Whether `slot` can take writes right now.
    pub fn is_usable(&self, slot: usize) -> bool {
        self.state(slot) == Some(WorkerState::Active)
    }

    /// A receiver that is marked changed on every transition of any slot.
    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.pulse.subscribe()
    }

    /// A receiver for one slot's state.
    pub fn watch_slot(&self, slot: usize) -> Option<watch::Receiver<WorkerState>> {
        self.ports.get(slot).map(|p| p.state.clone())
    }

    /// Claims a slot's inbound bytes. Only one router may hold them.
    pub fn take_reader(&self, slot: usize) -> Result<mpsc::Receiver<Bytes>, RouterError> {
        self.ports
            .get(slot)
            .and_then(|p| lock(&p.reader).take())
            .ok_or(RouterError::ReaderTaken {
                table: self.role,
                slot,
            })
    }

    /// Writes `payload` through `slot`.
    ///
    /// Returns the payload untouched when the slot is not `Active`, rejects
    /// it, or leaves `Active` before acknowledging it.
    pub async fn write(&self, slot: usize, payload: Bytes) -> Result<(), Bytes> {
        let Some(port) = self.ports.get(slot) else {
            return Err(payload);
        };
        let mut state = port.state.clone();
        if *state.borrow_and_update() != WorkerState::Active {
            return Err(payload);
        }

        let (ack, acked) = oneshot::channel();
        let request = WriteRequest {
            payload: payload.clone(),
            ack,
        };
        if port.writer.send(request).await.is_err() {
            return Err(payload);
        }

        let outcome = tokio::select! {
            biased;
            acked = acked => acked.ok(),
            _ = state.wait_for(|s| *s != WorkerState::Active) => None,
        };
        match outcome {
            Some(Ok(())) => Ok(()),
            _ => Err(payload),
        }
    }
}

impl Drop for WorkerTable {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerTable")
            .field("role", &self.role)
            .field("kind", &self.kind)
            .field("states", &self.states())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryConnector, Outcome};
    use std::time::Duration;

    fn spec(size: usize) -> TableSpec {
        TableSpec {
            role: TableRole::Producer,
            kind: WorkerKind::RelayConsumer,
            size,
            policy: RetryPolicy {
                max_retries: None,
                backoff_base: Duration::from_millis(5),
                backoff_max: Duration::from_millis(20),
            },
        }
    }

    async fn wait_for_state(table: &WorkerTable, slot: usize, want: WorkerState) {
        let mut rx = table.watch_slot(slot).unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
            .await
            .expect("state reached")
            .unwrap();
    }

    #[tokio::test]
    async fn size_is_fixed_whatever_the_slots_do() {
        let connector = MemoryConnector::new();
        connector.script(0, [Outcome::Fail, Outcome::Fail, Outcome::Connect]);
        connector.script(1, [Outcome::Hang]);
        let table = WorkerTable::new(spec(3), Arc::new(connector.clone()), None, Handle::current());
        assert_eq!(table.size(), 3);

        table.start();
        wait_for_state(&table, 0, WorkerState::Active).await;
        assert_eq!(table.size(), 3);
        table.stop();
        table.drained().await;
        assert_eq!(table.size(), 3);
        assert!(table.states().iter().all(|s| *s == WorkerState::Closed));
    }

    #[tokio::test]
    async fn retries_keep_the_slot_index() {
        let connector = MemoryConnector::new();
        connector.script(2, [Outcome::Fail, Outcome::Fail, Outcome::Connect]);
        let table = WorkerTable::new(spec(3), Arc::new(connector.clone()), None, Handle::current());
        table.start();
        wait_for_state(&table, 2, WorkerState::Active).await;
        assert_eq!(connector.attempts(2), 3);
        table.stop();
    }

    #[tokio::test]
    async fn stop_is_non_blocking_and_settles_every_slot() {
        let connector = MemoryConnector::new();
        connector.script(0, [Outcome::Hang]);
        connector.script(1, [Outcome::Hang]);
        let table = WorkerTable::new(spec(3), Arc::new(connector), None, Handle::current());
        table.start();
        wait_for_state(&table, 2, WorkerState::Active).await;

        table.stop();
        table.stop();
        let settled = tokio::time::timeout(Duration::from_secs(2), table.settled())
            .await
            .expect("all slots settle");
        assert_eq!(
            settled,
            vec![(0, Readiness::Closed), (1, Readiness::Closed), (2, Readiness::Connected)]
        );
    }

    #[tokio::test]
    async fn exhausted_retries_close_the_slot() {
        let connector = MemoryConnector::new();
        connector.script(0, [Outcome::Fail, Outcome::Fail, Outcome::Fail]);
        let mut spec = spec(1);
        spec.policy.max_retries = Some(1);
        let table = WorkerTable::new(spec, Arc::new(connector.clone()), None, Handle::current());
        table.start();
        assert_eq!(table.settled().await, vec![(0, Readiness::Closed)]);
        assert_eq!(connector.attempts(0), 2);
    }

    #[tokio::test]
    async fn writes_reach_the_remote_end_only_while_active() {
        let connector = MemoryConnector::new();
        let table = WorkerTable::new(spec(1), Arc::new(connector.clone()), None, Handle::current());
        assert_eq!(table.write(0, Bytes::from_static(b"early")).await, Err(Bytes::from_static(b"early")));

        table.start();
        wait_for_state(&table, 0, WorkerState::Active).await;
        table.write(0, Bytes::from_static(b"unit")).await.unwrap();
        let mut remote = connector.remote(0).await.unwrap();
        assert_eq!(remote.recv().await.unwrap(), Bytes::from_static(b"unit"));

        remote.send(Bytes::from_static(b"reply")).await;
        let mut reader = table.take_reader(0).unwrap();
        assert_eq!(reader.recv().await.unwrap(), Bytes::from_static(b"reply"));
        assert!(matches!(table.take_reader(0), Err(RouterError::ReaderTaken { slot: 0, .. })));
        table.stop();
    }

    #[tokio::test]
    async fn start_is_idempotent_and_restartable() {
        let connector = MemoryConnector::new();
        let table = WorkerTable::new(spec(2), Arc::new(connector.clone()), None, Handle::current());
        table.start();
        table.start();
        assert_eq!(table.settled().await.len(), 2);
        assert_eq!(connector.attempts(0), 1);

        table.stop();
        table.drained().await;
        table.start();
        wait_for_state(&table, 0, WorkerState::Active).await;
        assert_eq!(connector.attempts(0), 2);
        table.stop();
    }
}
