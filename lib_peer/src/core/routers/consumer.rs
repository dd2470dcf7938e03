//! Consumer discipline.
//!
//! Bytes read from consumer slot `i` go upstream as chunks tagged `i`;
//! downstream chunks tagged `i` are written back into slot `i`. A chunk
//! waits for its slot to become usable. Once a slot has been unusable for
//! longer than the starvation threshold its pending chunks are discarded
//! until it comes back: the link they answered is gone.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::{hold_for_slot, RouterContext, Starvation, TableRouter};
use crate::configs::Discipline;
use crate::core::bus::{BusMessage, BusSide};
use crate::core::table::WorkerTable;
use crate::error::RouterError;

pub struct ConsumerRouter {
    table: Arc<WorkerTable>,
    side: Option<BusSide>,
    ctx: RouterContext,
}

impl ConsumerRouter {
    pub fn new(table: Arc<WorkerTable>, side: BusSide, ctx: RouterContext) -> Self {
        Self {
            table,
            side: Some(side),
            ctx,
        }
    }
}

impl TableRouter for ConsumerRouter {
    fn discipline(&self) -> Discipline {
        Discipline::Consumer
    }

    fn init(&mut self) -> Result<(), RouterError> {
        let readers = (0..self.table.size())
            .map(|slot| self.table.take_reader(slot))
            .collect::<Result<Vec<_>, _>>()?;
        let BusSide { tx, rx, control } = self.side.take().ok_or(RouterError::AlreadyInitialized(self.table.role()))?;

        for (slot, reader) in readers.into_iter().enumerate() {
            self.ctx.handle.spawn(pump_upstream(slot, reader, tx.clone(), self.ctx.clone()));
        }

        let writer = SlotWriter {
            table: self.table.clone(),
            pulse: self.table.subscribe(),
            abandoned: vec![false; self.table.size()],
            starvation: Starvation {
                table: self.table.role(),
                threshold: self.ctx.starvation_threshold,
                report: control,
            },
            ctx: self.ctx.clone(),
        };
        self.ctx.handle.spawn(writer.run(rx));
        tracing::info!(slots = self.table.size(), kind = %self.table.kind(), "consumer router initialized");
        Ok(())
    }

    fn bindings(&self) -> Vec<Option<usize>> {
        Vec::new()
    }
}

async fn pump_upstream(slot: usize, mut reader: mpsc::Receiver<Bytes>, tx: mpsc::Sender<BusMessage>, ctx: RouterContext) {
    loop {
        let payload = tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            payload = reader.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            sent = tx.send(BusMessage::chunk(payload, slot)) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

struct SlotWriter {
    table: Arc<WorkerTable>,
    pulse: watch::Receiver<()>,
    /// Slots whose traffic is being discarded until they are usable again.
    abandoned: Vec<bool>,
    starvation: Starvation,
    ctx: RouterContext,
}

impl SlotWriter {
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
        tracing::debug!("consumer router writer stopped");
    }

    async fn deliver(&mut self, slot: usize, mut payload: Bytes) {
        if slot >= self.table.size() {
            tracing::warn!(slot, bytes = payload.len(), "chunk for unknown consumer slot discarded");
            return;
        }
        loop {
            if self.table.is_usable(slot) {
                self.abandoned[slot] = false;
                match self.table.write(slot, payload).await {
                    Ok(()) => return,
                    Err(back) => payload = back,
                }
            }
            if self.abandoned[slot] {
                tracing::debug!(slot, bytes = payload.len(), "slot still down, chunk discarded");
                return;
            }

            let table = &self.table;
            let held = hold_for_slot(&mut self.pulse, &self.ctx.shutdown, &self.starvation, true, || {
                table.is_usable(slot).then_some(slot)
            })
            .await;
            if held.is_none() {
                if !self.ctx.shutdown.is_cancelled() {
                    tracing::warn!(slot, bytes = payload.len(), "consumer slot unusable, chunk discarded");
                    self.abandoned[slot] = true;
                }
                return;
            }
        }
    }
}
