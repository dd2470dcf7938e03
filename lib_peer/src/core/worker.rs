//! # Worker
//!
//! One slot's connection lifecycle. A worker runs as a single task per boot
//! cycle and loops through negotiation attempts until it is stopped or its
//! retry budget runs out:
//!
//! ```text
//! Negotiating ─ok─► Connected ─► Active ══ session ══╗
//!      ▲  │                                          ║ I/O error / remote close
//!      │  └─err──────────────────────► Failing ◄═════╝
//!      └──────── randomized backoff ─────┘   └── retries exhausted ──► Closed
//! ```
//!
//! Stop (cancellation of the cycle token) moves the worker to `Closed` from
//! any state.
//!
//! The router-facing ports of a slot outlive the task: the write queue and
//! the inbound byte channel are created once with the table and handed from
//! cycle to cycle. While the worker is not `Active`, every queued write is
//! rejected on the spot and handed back to the router with its payload, so
//! the router can place it elsewhere.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::bus::{BusMessage, ControlSender};
use super::state::{Readiness, TableRole, WorkerKind, WorkerState};
use crate::error::LinkError;
use crate::transports::{Connector, Link};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// A payload on its way into a slot, with the channel its outcome is
/// reported on. A rejected payload comes back untouched.
#[derive(Debug)]
pub struct WriteRequest {
    pub payload: Bytes,
    pub ack: oneshot::Sender<Result<(), Bytes>>,
}

impl WriteRequest {
    fn reject(self) {
        let _ = self.ack.send(Err(self.payload));
    }
}

/// Retry policy shared by all workers of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: Option<u32>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `failures` in a row.
    pub fn allows_retry(&self, failures: u32) -> bool {
        self.max_retries.is_none_or(|max| failures <= max)
    }

    /// Upper bound of the delay before attempt number `failures + 1`.
    pub fn ceiling(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }

    /// A delay drawn uniformly from the upper half of the ceiling.
    pub fn backoff(&self, failures: u32) -> Duration {
        let ceiling = self.ceiling(failures);
        let floor = ceiling / 2;
        if ceiling <= floor {
            return ceiling;
        }
        rand::rng().random_range(floor..=ceiling)
    }
}

/// The worker-side ends of a slot's persistent ports.
#[derive(Debug)]
pub(crate) struct WorkerIo {
    pub(crate) writes: mpsc::Receiver<WriteRequest>,
    pub(crate) inbound: mpsc::Sender<Bytes>,
}

impl WorkerIo {
    /// Rejects every write that is already queued.
    fn reject_queued(&mut self) -> usize {
        let mut rejected = 0;
        while let Ok(req) = self.writes.try_recv() {
            req.reject();
            rejected += 1;
        }
        rejected
    }

    /// Drives `fut` to completion, rejecting writes that arrive meanwhile.
    async fn reject_while<F: std::future::Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                out = &mut fut => return out,
                Some(req) = self.writes.recv() => req.reject(),
            }
        }
    }
}

enum SessionEnd {
    Stopped,
    Failed(LinkError),
}

/// One slot's state machine.
pub(crate) struct Worker {
    pub(crate) index: usize,
    pub(crate) table: TableRole,
    pub(crate) kind: WorkerKind,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) policy: RetryPolicy,
    pub(crate) io: Arc<Mutex<WorkerIo>>,
    pub(crate) state: watch::Sender<WorkerState>,
    /// Bumped on every transition of any slot in the table.
    pub(crate) pulse: Arc<watch::Sender<()>>,
    pub(crate) events: Option<ControlSender>,
}

impl Worker {
    fn transition(&self, next: WorkerState, location: Option<&str>) {
        let prev = *self.state.borrow();
        if prev == next {
            return;
        }
        if !prev.can_transition_to(next) {
            tracing::warn!(slot = self.index, table = %self.table, %prev, %next, "unexpected worker transition");
        }
        self.state.send_replace(next);
        self.pulse.send_modify(|_| {});
        tracing::debug!(slot = self.index, table = %self.table, kind = %self.kind, state = %next, "worker state changed");

        if let Some(events) = &self.events {
            let change = BusMessage::ConnectionChange {
                table: self.table,
                state: next,
                slot: self.index,
                location: location.map(str::to_string),
            };
            if events.send(change).is_err() {
                tracing::trace!(slot = self.index, table = %self.table, %next, "bus gone, connection change not reported");
            }
        }
    }

    /// Runs one boot cycle of this slot. `ready` fires on the first
    /// `Connected` or on `Closed`, whichever comes first.
    pub(crate) async fn run(self: Arc<Self>, cancel: CancellationToken, ready: oneshot::Sender<Readiness>) {
        let mut io = self.io.lock().await;
        let mut ready = Some(ready);
        let mut failures: u32 = 0;

        while !cancel.is_cancelled() {
            self.transition(WorkerState::Negotiating, None);
            let attempt = io
                .reject_while(async {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(LinkError::Stopped),
                        link = self.connector.connect(self.index) => link,
                    }
                })
                .await;

            let cause = match attempt {
                Ok(link) => {
                    let location = link.location.clone();
                    self.transition(WorkerState::Connected, location.as_deref());
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Readiness::Connected);
                    }
                    let stale = io.reject_queued();
                    if stale > 0 {
                        tracing::debug!(slot = self.index, stale, "rejected writes queued before the session");
                    }
                    self.transition(WorkerState::Active, location.as_deref());
                    failures = 0;

                    match self.session(&mut io, link, &cancel).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Failed(e) => e,
                    }
                }
                Err(LinkError::Stopped) => break,
                Err(e) => e,
            };

            failures = failures.saturating_add(1);
            tracing::warn!(slot = self.index, table = %self.table, kind = %self.kind, failures, error = %cause, "worker failing");
            self.transition(WorkerState::Failing, None);

            if !self.policy.allows_retry(failures) {
                tracing::warn!(slot = self.index, table = %self.table, failures, "retries exhausted, closing slot");
                break;
            }
            let delay = self.policy.backoff(failures);
            tracing::debug!(slot = self.index, ?delay, "backing off");
            let stopped = io
                .reject_while(async {
                    tokio::select! {
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    }
                })
                .await;
            if stopped {
                break;
            }
        }

        self.transition(WorkerState::Closed, None);
        io.reject_queued();
        if let Some(ready) = ready.take() {
            let _ = ready.send(Readiness::Closed);
        }
    }

    /// Pumps bytes between the link and the slot's ports while Active.
    async fn session(&self, io: &mut WorkerIo, link: Link, cancel: &CancellationToken) -> SessionEnd {
        let Link { mut sink, mut stream, .. } = link;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
                    return SessionEnd::Stopped;
                }
                req = io.writes.recv() => {
                    let Some(WriteRequest { payload, ack }) = req else {
                        return SessionEnd::Stopped;
                    };
                    match sink.send(payload.clone()).await {
                        Ok(()) => {
                            let _ = ack.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = ack.send(Err(payload));
                            return SessionEnd::Failed(e);
                        }
                    }
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return SessionEnd::Stopped,
                            sent = io.inbound.send(bytes) => {
                                if sent.is_err() {
                                    tracing::trace!(slot = self.index, "no router attached, inbound data discarded");
                                }
                            }
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    None => return SessionEnd::Failed(LinkError::RemoteClosed),
                },
            }
        }
    }
}
