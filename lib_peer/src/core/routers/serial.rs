//! Serial discipline: each lane is pinned to one producer slot.
//!
//! Lanes are the consumer table's slots. A lane stays bound to its slot
//! until the slot stops being usable or a write through it fails; the lane
//! then moves to the lowest-indexed usable slot that no other lane holds,
//! skipping the slot that just failed. Bindings are refreshed eagerly on
//! every table transition, so a lane is bound as soon as any slot comes up.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::{hold_for_slot, RouterContext, Starvation, TableRouter};
use crate::configs::Discipline;
use crate::core::bus::{BusMessage, BusSide};
use crate::core::lock;
use crate::core::table::WorkerTable;
use crate::error::{ConfigError, RouterError};

/// Lane to slot bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LaneBook {
    lanes: Vec<Option<usize>>,
}

impl LaneBook {
    pub(crate) fn new(lanes: usize) -> Self {
        Self {
            lanes: vec![None; lanes],
        }
    }

    pub(crate) fn bound(&self, lane: usize) -> Option<usize> {
        self.lanes.get(lane).copied().flatten()
    }

    pub(crate) fn lane_of(&self, slot: usize) -> Option<usize> {
        self.lanes.iter().position(|b| *b == Some(slot))
    }

    fn bind(&mut self, lane: usize, slot: usize) {
        tracing::info!(lane, slot, "lane bound");
        self.lanes[lane] = Some(slot);
    }

    fn unbind(&mut self, lane: usize) {
        if let Some(slot) = self.lanes[lane].take() {
            tracing::info!(lane, slot, "lane unbound");
        }
    }

    /// Lowest-indexed slot that is usable, free, and not `excluded`.
    pub(crate) fn pick(&self, usable: impl Fn(usize) -> bool, size: usize, excluded: Option<usize>) -> Option<usize> {
        (0..size).find(|&slot| Some(slot) != excluded && usable(slot) && self.lane_of(slot).is_none())
    }

    /// Drops bindings to unusable slots and binds every free lane.
    pub(crate) fn refresh(&mut self, usable: impl Fn(usize) -> bool, size: usize) {
        for lane in 0..self.lanes.len() {
            if self.bound(lane).is_some_and(|slot| !usable(slot)) {
                self.unbind(lane);
            }
            if self.bound(lane).is_none() {
                if let Some(slot) = self.pick(&usable, size, None) {
                    self.bind(lane, slot);
                }
            }
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Option<usize>> {
        self.lanes.clone()
    }
}

pub struct SerialRouter {
    table: Arc<WorkerTable>,
    book: Arc<Mutex<LaneBook>>,
    side: Option<BusSide>,
    ctx: RouterContext,
}

impl SerialRouter {
    /// `lanes` is the consumer table's size and must lie within
    /// `1..=table.size()`.
    pub fn new(table: Arc<WorkerTable>, side: BusSide, lanes: usize, ctx: RouterContext) -> Result<Self, ConfigError> {
        if lanes == 0 || lanes > table.size() {
            return Err(ConfigError::LaneCount {
                lanes,
                producers: table.size(),
            });
        }
        Ok(Self {
            table,
            book: Arc::new(Mutex::new(LaneBook::new(lanes))),
            side: Some(side),
            ctx,
        })
    }

    pub fn lanes(&self) -> usize {
        lock(&self.book).lanes.len()
    }
}

impl TableRouter for SerialRouter {
    fn discipline(&self) -> Discipline {
        Discipline::Serial
    }

    fn init(&mut self) -> Result<(), RouterError> {
        let readers = (0..self.table.size())
            .map(|slot| self.table.take_reader(slot))
            .collect::<Result<Vec<_>, _>>()?;
        let BusSide { tx, rx, control } = self.side.take().ok_or(RouterError::AlreadyInitialized(self.table.role()))?;

        for (slot, reader) in readers.into_iter().enumerate() {
            self.ctx.handle.spawn(pump_replies(
                slot,
                reader,
                self.book.clone(),
                tx.clone(),
                self.ctx.clone(),
            ));
        }

        let starvation = Starvation {
            table: self.table.role(),
            threshold: self.ctx.starvation_threshold,
            report: control,
        };
        let writer = LaneWriter {
            table: self.table.clone(),
            book: self.book.clone(),
            pulse: self.table.subscribe(),
            starvation,
            ctx: self.ctx.clone(),
        };
        self.ctx.handle.spawn(writer.run(rx));
        tracing::info!(lanes = self.lanes(), slots = self.table.size(), "serial router initialized");
        Ok(())
    }

    fn bindings(&self) -> Vec<Option<usize>> {
        lock(&self.book).snapshot()
    }
}

/// Forwards replies from one producer slot to the lane bound to it.
async fn pump_replies(
    slot: usize,
    mut reader: mpsc::Receiver<Bytes>,
    book: Arc<Mutex<LaneBook>>,
    tx: mpsc::Sender<BusMessage>,
    ctx: RouterContext,
) {
    loop {
        let payload = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            payload = reader.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        let Some(lane) = lock(&book).lane_of(slot) else {
            tracing::trace!(slot, bytes = payload.len(), "reply from unbound slot discarded");
            continue;
        };
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            sent = tx.send(BusMessage::chunk(payload, lane)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

/// Current slot for `lane`, binding one if needed.
fn select(table: &WorkerTable, book: &Mutex<LaneBook>, lane: usize, excluded: Option<usize>) -> Option<usize> {
    let mut book = lock(book);
    match book.bound(lane) {
        Some(slot) if table.is_usable(slot) && Some(slot) != excluded => Some(slot),
        _ => {
            book.unbind(lane);
            let slot = book.pick(|s| table.is_usable(s), table.size(), excluded)?;
            book.bind(lane, slot);
            Some(slot)
        }
    }
}

struct LaneWriter {
    table: Arc<WorkerTable>,
    book: Arc<Mutex<LaneBook>>,
    pulse: watch::Receiver<()>,
    starvation: Starvation,
    ctx: RouterContext,
}

enum Next {
    Stop,
    Refresh,
    Unit(BusMessage),
}

impl LaneWriter {
    async fn run(mut self, mut rx: mpsc::Receiver<BusMessage>) {
        self.refresh();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.ctx.shutdown.cancelled() => Next::Stop,
                changed = self.pulse.changed() => match changed {
                    Ok(()) => Next::Refresh,
                    Err(_) => Next::Stop,
                },
                msg = rx.recv() => msg.map_or(Next::Stop, Next::Unit),
            };
            match next {
                Next::Stop => break,
                Next::Refresh => self.refresh(),
                Next::Unit(BusMessage::Chunk { payload, slot: lane }) => self.deliver(lane, payload).await,
                Next::Unit(other) => tracing::trace!(?other, "non-chunk message ignored"),
            }
        }
        tracing::debug!("serial router writer stopped");
    }

    fn refresh(&mut self) {
        self.pulse.borrow_and_update();
        let table = &self.table;
        lock(&self.book).refresh(|slot| table.is_usable(slot), table.size());
    }

    async fn deliver(&mut self, lane: usize, mut payload: Bytes) {
        if lane >= lock(&self.book).lanes.len() {
            tracing::warn!(lane, bytes = payload.len(), "chunk for unknown lane discarded");
            return;
        }
        let mut excluded = None;
        loop {
            let slot = match select(&self.table, &self.book, lane, excluded) {
                Some(slot) => slot,
                None => {
                    let (table, book) = (&self.table, &self.book);
                    let mut first = true;
                    let held = hold_for_slot(&mut self.pulse, &self.ctx.shutdown, &self.starvation, false, || {
                        let skip = if first { excluded } else { None };
                        first = false;
                        select(table, book, lane, skip)
                    })
                    .await;
                    match held {
                        Some(slot) => slot,
                        None => {
                            tracing::debug!(lane, "router shutting down with a held unit");
                            return;
                        }
                    }
                }
            };

            match self.table.write(slot, payload).await {
                Ok(()) => return,
                Err(back) => {
                    tracing::warn!(lane, slot, "write failed, failing over");
                    payload = back;
                    let mut book = lock(&self.book);
                    if book.bound(lane) == Some(slot) {
                        book.unbind(lane);
                    }
                    excluded = Some(slot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_lowest_free_usable_slot() {
        let usable = |s: usize| s != 0;
        let mut book = LaneBook::new(2);
        book.refresh(usable, 5);
        assert_eq!(book.snapshot(), vec![Some(1), Some(2)]);
        assert_eq!(book.lane_of(2), Some(1));
        assert_eq!(book.pick(usable, 5, None), Some(3));
        assert_eq!(book.pick(usable, 5, Some(3)), Some(4));
    }

    #[test]
    fn refresh_moves_lanes_off_dead_slots() {
        let mut book = LaneBook::new(1);
        book.refresh(|_| true, 3);
        assert_eq!(book.bound(0), Some(0));

        book.refresh(|s| s != 0, 3);
        assert_eq!(book.bound(0), Some(1));

        book.refresh(|_| false, 3);
        assert_eq!(book.bound(0), None);
    }

    #[test]
    fn at_most_one_lane_per_slot() {
        let mut book = LaneBook::new(3);
        book.refresh(|s| s == 2, 4);
        assert_eq!(book.snapshot(), vec![Some(2), None, None]);
    }
}
