//! Pool discipline: every usable producer slot takes traffic.
//!
//! A producer slot carries the flow of one consumer slot at a time, so a
//! reply read from it always has exactly one destination. A consumer claims
//! a free slot with its first unit and keeps it while both ends stay
//! usable; replies from that slot go back to it. Within what it may use,
//! each unit goes to the least recently used slot (lowest index on ties),
//! chosen afresh per unit. A consumer takes a further free slot only while
//! enough free slots remain for every other connected consumer that holds
//! none.
//!
//! A failed write excludes that slot and the same unit is placed on the
//! next candidate; units already written through other slots are not
//! touched.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::{hold_for_slot, joint_pulse, RouterContext, Starvation, TableRouter};
use crate::configs::Discipline;
use crate::core::bus::{BusMessage, BusSide};
use crate::core::lock;
use crate::core::table::WorkerTable;
use crate::error::RouterError;

#[derive(Debug, Clone, Default)]
pub(crate) struct PoolBook {
    last_used: Vec<u64>,
    owner: Vec<Option<usize>>,
    clock: u64,
}

impl PoolBook {
    pub(crate) fn new(slots: usize) -> Self {
        Self {
            last_used: vec![0; slots],
            owner: vec![None; slots],
            clock: 0,
        }
    }

    /// Ends claims on slots that are no longer usable and claims held by
    /// consumers that are no longer live.
    pub(crate) fn release(&mut self, usable: impl Fn(usize) -> bool, live: impl Fn(usize) -> bool) {
        for (slot, owner) in self.owner.iter_mut().enumerate() {
            if let Some(from) = *owner {
                if !usable(slot) || !live(from) {
                    tracing::debug!(slot, from, "pool slot released");
                    *owner = None;
                }
            }
        }
    }

    /// Least recently used slot consumer `from` may write through, not in
    /// `excluded`. `consumers` is the consumer table size.
    pub(crate) fn pick(
        &self,
        from: usize,
        usable: impl Fn(usize) -> bool,
        live: impl Fn(usize) -> bool,
        consumers: usize,
        excluded: &[usize],
    ) -> Option<usize> {
        let holder = |slot: usize| self.owner[slot].filter(|o| live(*o));
        let open: Vec<usize> = (0..self.owner.len())
            .filter(|slot| !excluded.contains(slot) && usable(*slot))
            .collect();
        let own = open.iter().filter(|s| holder(**s) == Some(from)).count();
        let free = open.iter().filter(|s| holder(**s).is_none()).count();
        let waiting = (0..consumers)
            .filter(|c| *c != from && live(*c))
            .filter(|c| !(0..self.owner.len()).any(|s| usable(s) && holder(s) == Some(*c)))
            .count();
        let may_claim = own == 0 || free > waiting;

        open.into_iter()
            .filter(|s| match holder(*s) {
                Some(o) => o == from,
                None => may_claim,
            })
            .min_by_key(|&slot| (self.last_used[slot], slot))
    }

    /// Records that `slot` carries traffic of consumer slot `from`.
    pub(crate) fn assign(&mut self, slot: usize, from: usize) {
        self.clock += 1;
        self.last_used[slot] = self.clock;
        if self.owner[slot] != Some(from) {
            tracing::debug!(slot, from, "pool slot claimed");
            self.owner[slot] = Some(from);
        }
    }

    pub(crate) fn owner(&self, slot: usize) -> Option<usize> {
        self.owner.get(slot).copied().flatten()
    }

    pub(crate) fn snapshot(&self) -> Vec<Option<usize>> {
        self.owner.clone()
    }
}

pub struct PoolRouter {
    table: Arc<WorkerTable>,
    consumers: Arc<WorkerTable>,
    book: Arc<Mutex<PoolBook>>,
    side: Option<BusSide>,
    ctx: RouterContext,
}

impl PoolRouter {
    /// `consumers` is the table whose slots originate the upstream units.
    pub fn new(table: Arc<WorkerTable>, consumers: Arc<WorkerTable>, side: BusSide, ctx: RouterContext) -> Self {
        let book = Arc::new(Mutex::new(PoolBook::new(table.size())));
        Self {
            table,
            consumers,
            book,
            side: Some(side),
            ctx,
        }
    }
}

impl TableRouter for PoolRouter {
    fn discipline(&self) -> Discipline {
        Discipline::Pool
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

        let writer = PoolWriter {
            table: self.table.clone(),
            consumers: self.consumers.clone(),
            book: self.book.clone(),
            pulse: joint_pulse(&self.table, &self.consumers, &self.ctx),
            starvation: Starvation {
                table: self.table.role(),
                threshold: self.ctx.starvation_threshold,
                report: control,
            },
            ctx: self.ctx.clone(),
        };
        self.ctx.handle.spawn(writer.run(rx));
        tracing::info!(slots = self.table.size(), consumers = self.consumers.size(), "pool router initialized");
        Ok(())
    }

    fn bindings(&self) -> Vec<Option<usize>> {
        lock(&self.book).snapshot()
    }
}

async fn pump_replies(
    slot: usize,
    mut reader: mpsc::Receiver<Bytes>,
    book: Arc<Mutex<PoolBook>>,
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
        let Some(origin) = lock(&book).owner(slot) else {
            tracing::trace!(slot, bytes = payload.len(), "reply from an unclaimed slot, discarded");
            continue;
        };
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            sent = tx.send(BusMessage::chunk(payload, origin)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

struct PoolWriter {
    table: Arc<WorkerTable>,
    consumers: Arc<WorkerTable>,
    book: Arc<Mutex<PoolBook>>,
    /// Fires on transitions of either table.
    pulse: watch::Receiver<()>,
    starvation: Starvation,
    ctx: RouterContext,
}

impl PoolWriter {
    async fn run(mut self, mut rx: mpsc::Receiver<BusMessage>) {
        loop {
            let msg = tokio::select! {
                _ = self.ctx.shutdown.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            match msg {
                BusMessage::Chunk { payload, slot } => self.deliver(slot, payload).await,
                other => tracing::trace!(?other, "non-chunk message ignored"),
            }
        }
        tracing::debug!("pool router writer stopped");
    }

    async fn deliver(&mut self, from: usize, mut payload: Bytes) {
        let mut excluded = Vec::new();
        loop {
            let (table, consumers, book) = (&self.table, &self.consumers, &self.book);
            let assign = |excluded: &[usize]| {
                let usable = |s: usize| table.is_usable(s);
                let live = |c: usize| consumers.is_usable(c);
                let mut book = lock(book);
                book.release(usable, live);
                let slot = book.pick(from, usable, live, consumers.size(), excluded)?;
                book.assign(slot, from);
                Some(slot)
            };

            let slot = match assign(&excluded) {
                Some(slot) => slot,
                None => {
                    let mut first = true;
                    let held = hold_for_slot(&mut self.pulse, &self.ctx.shutdown, &self.starvation, false, || {
                        let skip: &[usize] = if first { &excluded } else { &[] };
                        first = false;
                        assign(skip)
                    })
                    .await;
                    match held {
                        Some(slot) => slot,
                        None => {
                            tracing::debug!(from, "router shutting down with a held unit");
                            return;
                        }
                    }
                }
            };

            match self.table.write(slot, payload).await {
                Ok(()) => return,
                Err(back) => {
                    tracing::warn!(from, slot, "write failed, trying another slot");
                    payload = back;
                    excluded.push(slot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: fn(usize) -> bool = |_| true;

    #[test]
    fn least_recently_used_wins_lowest_index_on_ties() {
        let mut book = PoolBook::new(3);
        assert_eq!(book.pick(7, ALL, ALL, 1, &[]), Some(0));
        book.assign(0, 7);
        assert_eq!(book.pick(7, ALL, ALL, 1, &[]), Some(1));
        book.assign(1, 7);
        book.assign(2, 7);
        assert_eq!(book.pick(7, ALL, ALL, 1, &[]), Some(0));
        assert_eq!(book.pick(7, ALL, ALL, 1, &[0]), Some(1));
        assert_eq!(book.pick(7, |s| s == 2, ALL, 1, &[]), Some(2));
        assert_eq!(book.pick(7, |s| s == 2, ALL, 1, &[2]), None);
    }

    #[test]
    fn a_claimed_slot_serves_only_its_consumer() {
        let mut book = PoolBook::new(1);
        book.assign(0, 0);
        assert_eq!(book.pick(1, ALL, ALL, 2, &[]), None);
        assert_eq!(book.pick(0, ALL, ALL, 2, &[]), Some(0));
        assert_eq!(book.owner(0), Some(0));

        // The owner went away: the slot is free again.
        let live = |c| c != 0;
        book.release(ALL, live);
        assert_eq!(book.owner(0), None);
        let slot = book.pick(1, ALL, live, 2, &[]).unwrap();
        book.assign(slot, 1);
        assert_eq!(book.snapshot(), vec![Some(1)]);
    }

    #[test]
    fn claims_leave_room_for_connected_consumers() {
        let mut book = PoolBook::new(3);
        for _ in 0..6 {
            let slot = book.pick(0, ALL, ALL, 2, &[]).unwrap();
            book.assign(slot, 0);
        }
        assert_eq!(book.snapshot(), vec![Some(0), Some(0), None]);
        let slot = book.pick(1, ALL, ALL, 2, &[]).unwrap();
        assert_eq!(slot, 2);

        // Alone, a consumer spreads over every slot.
        let mut book = PoolBook::new(3);
        for _ in 0..3 {
            let slot = book.pick(0, ALL, |c| c == 0, 2, &[]).unwrap();
            book.assign(slot, 0);
        }
        assert_eq!(book.snapshot(), vec![Some(0); 3]);
    }

    #[test]
    fn failed_slots_drop_their_claim() {
        let mut book = PoolBook::new(2);
        book.assign(0, 3);
        book.assign(1, 4);
        book.release(|s| s == 1, ALL);
        assert_eq!(book.snapshot(), vec![None, Some(4)]);
    }
}
