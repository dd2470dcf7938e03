//! # Engine
//!
//! The composition root. [`Engine::boot`] evaluates the client type's
//! [`BootRecipe`] with one generic routine:
//!
//! 1. validate the options and resolve a connector for each table's kind,
//! 2. build the bus with the observer-facing handlers,
//! 3. build both tables with the options' retry policy,
//! 4. attach the router each table's discipline names,
//! 5. start the bus drains and the throughput ticker,
//! 6. announce readiness.
//!
//! Any misconfiguration surfaces as a [`ConfigError`] before a single task
//! is spawned. Tables stay idle until [`Engine::start`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::bus::{BusHandlers, BusSide, EventBus};
use super::routers::{ConsumerRouter, PoolRouter, RouterContext, SerialRouter, TableRouter};
use super::state::{TableRole, WorkerKind, WorkerState};
use super::table::{TableSpec, WorkerTable};
use super::worker::RetryPolicy;
use crate::configs::{BootRecipe, ClientOptions, ClientType, Discipline};
use crate::error::ConfigError;
use crate::observer::throughput::spawn_ticker;
use crate::observer::{control_handler, downstream_handler, upstream_handler, NetstateReporter, Observer, ThroughputMeter};
use crate::transports::Transports;

/// Point-in-time view of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableSnapshot {
    pub kind: WorkerKind,
    pub discipline: Discipline,
    pub states: Vec<WorkerState>,
    pub bindings: Vec<Option<usize>>,
}

/// Point-in-time view of the whole engine, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineSnapshot {
    pub client_type: ClientType,
    pub bus_capacity: usize,
    pub consumer: TableSnapshot,
    pub producer: TableSnapshot,
}

struct Side {
    table: Arc<WorkerTable>,
    router: Box<dyn TableRouter>,
}

impl Side {
    fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            kind: self.table.kind(),
            discipline: self.router.discipline(),
            states: self.table.states(),
            bindings: self.router.bindings(),
        }
    }
}

pub struct Engine {
    client_type: ClientType,
    bus_capacity: usize,
    consumer: Side,
    producer: Side,
    observer: Arc<dyn Observer>,
    handle: Handle,
    shutdown: CancellationToken,
    stopping: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
}

impl Engine {
    /// Builds and wires every component for `options.engine.client_type`.
    /// Must be called from within a tokio runtime.
    pub fn boot(options: &ClientOptions, transports: &Transports, observer: Arc<dyn Observer>) -> Result<Self, ConfigError> {
        let handle = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        options.validate()?;

        let engine_options = &options.engine;
        let recipe = BootRecipe::for_client(engine_options.client_type);
        let consumer_connector = transports.connector(recipe.consumer.kind)?;
        let producer_connector = transports.connector(recipe.producer.kind)?;

        let netstate = engine_options
            .netstated
            .as_deref()
            .map(|url| NetstateReporter::new(url, options.realtime.tag.clone(), handle.clone()))
            .transpose()?;
        let meter = ThroughputMeter::new();
        let (mut bus, consumer_side, producer_side) = EventBus::new(
            engine_options.bus_buffer_sz,
            BusHandlers {
                upstream: upstream_handler(),
                downstream: downstream_handler(observer.clone(), meter.clone()),
                control: control_handler(observer.clone(), netstate),
            },
        );

        let policy = RetryPolicy {
            max_retries: engine_options.max_retries,
            backoff_base: engine_options.backoff_base(),
            backoff_max: engine_options.backoff_max(),
        };
        let consumer_table = Arc::new(WorkerTable::new(
            TableSpec {
                role: TableRole::Consumer,
                kind: recipe.consumer.kind,
                size: recipe.consumer.slots(engine_options),
                policy,
            },
            consumer_connector.clone(),
            Some(consumer_side.control.clone()),
            handle.clone(),
        ));
        let producer_table = Arc::new(WorkerTable::new(
            TableSpec {
                role: TableRole::Producer,
                kind: recipe.producer.kind,
                size: recipe.producer.slots(engine_options),
                policy,
            },
            producer_connector,
            Some(producer_side.control.clone()),
            handle.clone(),
        ));

        let shutdown = CancellationToken::new();
        let ctx = RouterContext {
            handle: handle.clone(),
            shutdown: shutdown.clone(),
            starvation_threshold: engine_options.starvation_threshold(),
        };
        let mut producer = Side {
            router: build_router(recipe.producer.discipline, producer_table.clone(), producer_side, &consumer_table, ctx.clone())?,
            table: producer_table,
        };
        let mut consumer = Side {
            router: build_router(recipe.consumer.discipline, consumer_table.clone(), consumer_side, &consumer_table, ctx)?,
            table: consumer_table,
        };

        let attached = consumer.router.init().and_then(|()| producer.router.init());
        if let Err(e) = attached {
            shutdown.cancel();
            return Err(e.into());
        }
        bus.start(&handle, &shutdown);
        spawn_ticker(meter, observer.clone(), engine_options.ui_refresh_hz, &handle, shutdown.clone());

        tracing::info!(
            client_type = %engine_options.client_type,
            consumer_kind = %recipe.consumer.kind,
            consumer_slots = consumer.table.size(),
            producer_kind = %recipe.producer.kind,
            producer_slots = producer.table.size(),
            bus_capacity = bus.capacity(),
            "engine booted"
        );

        let engine = Self {
            client_type: engine_options.client_type,
            bus_capacity: bus.capacity(),
            consumer,
            producer,
            observer,
            handle,
            shutdown,
            stopping: Arc::new(AtomicBool::new(false)),
            local_addr: consumer_connector.local_addr(),
        };
        engine.observer.on_ready();
        engine.observer.on_startup();
        Ok(engine)
    }

    /// Starts both tables. Tables already running are left alone.
    pub fn start(&self) {
        self.consumer.table.start();
        self.producer.table.start();
    }

    /// Stops both tables and returns at once. The observer's `on_ready`
    /// fires once every slot of both tables has reported readiness and
    /// every worker task has exited. Calls made while a stop is still in
    /// flight only repeat the stop request.
    pub fn stop(&self) {
        self.consumer.table.stop();
        self.producer.table.stop();
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        let settled = futures_util::future::join(self.consumer.table.settled(), self.producer.table.settled());
        let drained = futures_util::future::join(self.consumer.table.drained(), self.producer.table.drained());
        let stopping = self.stopping.clone();
        let observer = self.observer.clone();
        self.handle.spawn(async move {
            let (consumer, producer) = settled.await;
            drained.await;
            tracing::info!(
                consumer_slots = consumer.len(),
                producer_slots = producer.len(),
                "engine stopped"
            );
            stopping.store(false, Ordering::Release);
            observer.on_ready();
        });
    }

    pub fn client_type(&self) -> ClientType {
        self.client_type
    }

    pub fn consumer_table(&self) -> &Arc<WorkerTable> {
        &self.consumer.table
    }

    pub fn producer_table(&self) -> &Arc<WorkerTable> {
        &self.producer.table
    }

    /// Where the local proxy endpoint listens, for client types that have
    /// one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            client_type: self.client_type,
            bus_capacity: self.bus_capacity,
            consumer: self.consumer.snapshot(),
            producer: self.producer.snapshot(),
        }
    }

    /// Logs the current snapshot.
    pub fn debug(&self) {
        match serde_json::to_string(&self.snapshot()) {
            Ok(json) => tracing::info!(snapshot = %json, "engine snapshot"),
            Err(e) => tracing::warn!(error = %e, "engine snapshot not serializable"),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.consumer.table.stop();
        self.producer.table.stop();
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("client_type", &self.client_type)
            .field("consumer", &self.consumer.table)
            .field("producer", &self.producer.table)
            .finish_non_exhaustive()
    }
}

/// `consumers` is the consumer table: it sizes the serial lanes and
/// originates the pool's flows.
fn build_router(
    discipline: Discipline,
    table: Arc<WorkerTable>,
    side: BusSide,
    consumers: &Arc<WorkerTable>,
    ctx: RouterContext,
) -> Result<Box<dyn TableRouter>, ConfigError> {
    Ok(match discipline {
        Discipline::Consumer => Box::new(ConsumerRouter::new(table, side, ctx)),
        Discipline::Serial => Box::new(SerialRouter::new(table, side, consumers.size(), ctx)?),
        Discipline::Pool => Box::new(PoolRouter::new(table, consumers.clone(), side, ctx)),
    })
}
