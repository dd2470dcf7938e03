//! In-memory doubles for driving tables, routers and the engine in tests.
//!
//! Available to unit tests and, behind the `testing` feature, to the
//! workspace scenario tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{sink, stream, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::core::lock;
use crate::core::state::{TableRole, WorkerState};
use crate::error::LinkError;
use crate::observer::Observer;
use crate::transports::realtime::{SignalEnvelope, SignalKind, Signaling};
use crate::transports::{Connector, Link};

/// How long helpers wait before giving up.
const PATIENCE: Duration = Duration::from_secs(2);
/// How long the memory signaling server holds a long-poll open.
const POLL: Duration = Duration::from_millis(100);
const LINK_DEPTH: usize = 64;

/// Waits on `notify` until `check` yields something or `deadline` passes.
async fn wait_on<T>(notify: &Notify, deadline: Instant, mut check: impl FnMut() -> Option<T>) -> Option<T> {
    loop {
        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if let Some(found) = check() {
            return Some(found);
        }
        if tokio::time::timeout_at(deadline, notified).await.is_err() {
            return None;
        }
    }
}

/// Scripted result of one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Connect,
    Fail,
    /// Never finishes; only a stop ends the attempt.
    Hang,
}

/// The far end of an in-memory link.
#[derive(Debug)]
pub struct RemoteEnd {
    pub slot: usize,
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

impl RemoteEnd {
    /// Next chunk written by the local side, if one arrives in time.
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::time::timeout(PATIENCE, self.rx.recv()).await.ok().flatten()
    }

    /// Chunk already written by the local side, without waiting.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    pub async fn send(&self, payload: Bytes) {
        let _ = self.tx.send(payload).await;
    }

    /// Tears the link down as if the remote vanished.
    pub fn fail(self) {}
}

#[derive(Default)]
struct MemoryState {
    scripts: HashMap<usize, VecDeque<Outcome>>,
    attempts: HashMap<usize, usize>,
    remotes: HashMap<usize, VecDeque<RemoteEnd>>,
}

/// A connector whose attempts follow per-slot scripts. Unscripted attempts
/// connect.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
    notify: Arc<Notify>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues outcomes for the next attempts of `slot`.
    pub fn script(&self, slot: usize, outcomes: impl IntoIterator<Item = Outcome>) {
        lock(&self.state).scripts.entry(slot).or_default().extend(outcomes);
    }

    pub fn attempts(&self, slot: usize) -> usize {
        lock(&self.state).attempts.get(&slot).copied().unwrap_or(0)
    }

    /// The far end of the next link established for `slot`.
    pub async fn remote(&self, slot: usize) -> Option<RemoteEnd> {
        let deadline = Instant::now() + PATIENCE;
        wait_on(&self.notify, deadline, || {
            lock(&self.state).remotes.get_mut(&slot).and_then(VecDeque::pop_front)
        })
        .await
    }

    fn link(&self, slot: usize) -> Link {
        let (to_remote, from_local) = mpsc::channel::<Bytes>(LINK_DEPTH);
        let (to_local, from_remote) = mpsc::channel::<Bytes>(LINK_DEPTH);
        lock(&self.state).remotes.entry(slot).or_default().push_back(RemoteEnd {
            slot,
            tx: to_local,
            rx: from_local,
        });
        self.notify.notify_waiters();

        let sink = sink::unfold(to_remote, |tx, payload: Bytes| async move {
            tx.send(payload).await.map_err(|_| LinkError::RemoteClosed)?;
            Ok::<_, LinkError>(tx)
        });
        let stream = stream::unfold(from_remote, |mut rx| async move { rx.recv().await.map(|b| (Ok(b), rx)) });
        Link {
            sink: Box::pin(sink),
            stream: stream.boxed(),
            location: Some(format!("memory:{slot}")),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, slot: usize) -> Result<Link, LinkError> {
        let outcome = {
            let mut state = lock(&self.state);
            *state.attempts.entry(slot).or_default() += 1;
            state
                .scripts
                .get_mut(&slot)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Outcome::Connect)
        };
        match outcome {
            Outcome::Connect => Ok(self.link(slot)),
            Outcome::Fail => Err(LinkError::Rejected(format!("scripted failure on slot {slot}"))),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct Broker {
    announced: VecDeque<String>,
    mailboxes: HashMap<String, VecDeque<SignalEnvelope>>,
    tags: Vec<String>,
}

/// A signaling service living in memory, with long-poll semantics.
#[derive(Default)]
pub struct MemorySignaling {
    broker: Mutex<Broker>,
    notify: Notify,
}

impl MemorySignaling {
    /// Tags of every envelope seen so far.
    pub fn seen_tags(&self) -> Vec<String> {
        lock(&self.broker).tags.clone()
    }

    async fn poll_mail(&self, who: &str, kind: SignalKind) -> Option<SignalEnvelope> {
        wait_on(&self.notify, Instant::now() + POLL, || {
            let mut broker = lock(&self.broker);
            let mailbox = broker.mailboxes.get_mut(who)?;
            let at = mailbox.iter().position(|e| e.kind == kind)?;
            mailbox.remove(at)
        })
        .await
    }

    fn post(&self, envelope: SignalEnvelope) {
        lock(&self.broker)
            .mailboxes
            .entry(envelope.to.clone())
            .or_default()
            .push_back(envelope);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Signaling for MemorySignaling {
    async fn exchange(&self, envelope: SignalEnvelope) -> Result<Option<SignalEnvelope>, LinkError> {
        lock(&self.broker).tags.push(envelope.tag.clone());
        match envelope.kind {
            SignalKind::Genesis => {
                {
                    let mut broker = lock(&self.broker);
                    if !broker.announced.contains(&envelope.from) {
                        broker.announced.push_back(envelope.from.clone());
                    }
                }
                self.notify.notify_waiters();
                let offer = self.poll_mail(&envelope.from, SignalKind::Offer).await;
                if offer.is_none() {
                    lock(&self.broker).announced.retain(|p| *p != envelope.from);
                }
                Ok(offer)
            }
            SignalKind::Discover => {
                let peer = wait_on(&self.notify, Instant::now() + POLL, || lock(&self.broker).announced.pop_front()).await;
                Ok(peer.map(|peer| SignalEnvelope {
                    from: peer,
                    to: envelope.from.clone(),
                    tag: envelope.tag.clone(),
                    kind: SignalKind::Genesis,
                    payload: String::new(),
                }))
            }
            SignalKind::Offer => {
                let me = envelope.from.clone();
                self.post(envelope);
                let answer = wait_on(&self.notify, Instant::now() + PATIENCE, || {
                    let mut broker = lock(&self.broker);
                    let mailbox = broker.mailboxes.get_mut(&me)?;
                    let at = mailbox.iter().position(|e| e.kind == SignalKind::Answer)?;
                    mailbox.remove(at)
                })
                .await;
                Ok(answer)
            }
            SignalKind::Answer => {
                self.post(envelope);
                Ok(None)
            }
        }
    }
}

/// One observer notification, as recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Ready,
    Startup,
    DownstreamChunk { size: usize, slot: usize },
    ConsumerConnectionChange { state: WorkerState, slot: usize, location: Option<String> },
    RoutingStarved(TableRole),
}

/// Records every notification except throughput samples.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
    notify: Notify,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        lock(&self.events).iter().filter(|e| *e == event).count()
    }

    /// Waits until the recorded events satisfy `pred`.
    pub async fn wait_until(&self, pred: impl Fn(&[Event]) -> bool) -> bool {
        let deadline = Instant::now() + PATIENCE;
        wait_on(&self.notify, deadline, || pred(&lock(&self.events)).then_some(())).await.is_some()
    }

    fn push(&self, event: Event) {
        lock(&self.events).push(event);
        self.notify.notify_waiters();
    }
}

impl Observer for RecordingObserver {
    fn on_ready(&self) {
        self.push(Event::Ready);
    }

    fn on_startup(&self) {
        self.push(Event::Startup);
    }

    fn on_downstream_chunk(&self, size: usize, slot: usize) {
        self.push(Event::DownstreamChunk { size, slot });
    }

    fn on_consumer_connection_change(&self, state: WorkerState, slot: usize, location: Option<&str>) {
        self.push(Event::ConsumerConnectionChange {
            state,
            slot,
            location: location.map(str::to_string),
        });
    }

    fn on_routing_starved(&self, table: TableRole, _waited: Duration) {
        self.push(Event::RoutingStarved(table));
    }
}
