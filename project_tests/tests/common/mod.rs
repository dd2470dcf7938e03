//! Helpers shared by the engine scenario tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lib_peer::testing::MemoryConnector;
use lib_peer::{ClientOptions, ClientType, Transports, WorkerKind};

/// Polls `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Options with short backoffs so failed slots come back quickly.
pub fn options(client_type: ClientType, consumers: usize, producers: usize) -> ClientOptions {
    let mut options = ClientOptions::default();
    options.engine.client_type = client_type;
    options.engine.c_table_size = consumers;
    options.engine.p_table_size = producers;
    options.engine.backoff_base_ms = 10;
    options.engine.backoff_max_ms = 20;
    options
}

/// In-memory connectors for both tables of a client type.
pub struct Wiring {
    pub consumers: MemoryConnector,
    pub producers: MemoryConnector,
    pub transports: Transports,
}

pub fn wiring(client_type: ClientType) -> Wiring {
    let (consumer_kind, producer_kind) = match client_type {
        ClientType::Desktop => (WorkerKind::LocalStream, WorkerKind::RealtimeConsumer),
        ClientType::Widget => (WorkerKind::RealtimeProducer, WorkerKind::RelayConsumer),
    };
    let consumers = MemoryConnector::new();
    let producers = MemoryConnector::new();
    let transports = Transports::new()
        .with(consumer_kind, Arc::new(consumers.clone()))
        .with(producer_kind, Arc::new(producers.clone()));
    Wiring {
        consumers,
        producers,
        transports,
    }
}
