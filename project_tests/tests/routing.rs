//! # Routing Across the Engine
//!
//! The widget recipe (realtime producers facing censored peers, a pool of
//! relay links) and ordering through the serial lane.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use lib_peer::testing::{Outcome, RecordingObserver, RemoteEnd};
use lib_peer::{ClientType, Discipline, Engine, WorkerState};

use common::{eventually, options, wiring};

fn unit(i: usize) -> Bytes {
    Bytes::from(format!("unit-{i:02}"))
}

/// Reads whatever the relay ends hold until `want` units arrived in total.
async fn gather(relays: &mut [Option<RemoteEnd>], seen: &mut HashMap<Bytes, Vec<usize>>, want: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while seen.values().map(Vec::len).sum::<usize>() < want && tokio::time::Instant::now() < deadline {
        for relay in relays.iter_mut().flatten() {
            while let Some(payload) = relay.try_recv() {
                seen.entry(payload).or_default().push(relay.slot);
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn pool_never_duplicates_a_unit_across_failures() {
    let wires = wiring(ClientType::Widget);
    let observer = RecordingObserver::new();
    let engine = Engine::boot(&options(ClientType::Widget, 2, 3), &wires.transports, observer.clone()).unwrap();
    assert_eq!(engine.snapshot().producer.discipline, Discipline::Pool);
    engine.start();

    let censored = wires.consumers.remote(0).await.unwrap();
    let mut relays = Vec::new();
    for slot in 0..3 {
        relays.push(Some(wires.producers.remote(slot).await.unwrap()));
    }
    let table = engine.producer_table().clone();
    assert!(eventually(|| table.states().iter().all(|s| *s == WorkerState::Active)).await);

    let mut seen = HashMap::new();
    for i in 0..9 {
        censored.send(unit(i)).await;
    }
    gather(&mut relays, &mut seen, 9).await;
    assert_eq!(seen.len(), 9);
    let used: std::collections::HashSet<usize> = seen.values().flatten().copied().collect();
    assert!(used.len() > 1, "the pool should spread load, used {used:?}");

    wires.producers.script(1, [Outcome::Fail; 100]);
    if let Some(relay) = relays[1].take() {
        relay.fail();
    }
    for i in 9..18 {
        censored.send(unit(i)).await;
    }
    gather(&mut relays, &mut seen, 18).await;

    for i in 0..18 {
        let slots = seen.get(&unit(i)).cloned().unwrap_or_default();
        assert_eq!(slots.len(), 1, "unit {i} delivered {} times", slots.len());
    }
    for i in 9..18 {
        assert_ne!(seen[&unit(i)], vec![1], "unit {i} went to the failed slot");
    }
}

#[tokio::test]
async fn pool_replies_return_to_the_originating_consumer() {
    let wires = wiring(ClientType::Widget);
    let engine = Engine::boot(&options(ClientType::Widget, 2, 1), &wires.transports, RecordingObserver::new()).unwrap();
    engine.start();

    let first = wires.consumers.remote(0).await.unwrap();
    let mut second = wires.consumers.remote(1).await.unwrap();
    let mut relay = wires.producers.remote(0).await.unwrap();
    let table = engine.producer_table().clone();
    assert!(eventually(|| table.is_usable(0)).await);
    let consumers = engine.consumer_table().clone();
    assert!(eventually(|| consumers.is_usable(0) && consumers.is_usable(1)).await);

    second.send(Bytes::from_static(b"request")).await;
    assert_eq!(relay.recv().await, Some(Bytes::from_static(b"request")));
    assert_eq!(engine.snapshot().producer.bindings, vec![Some(1)]);

    relay.send(Bytes::from_static(b"response")).await;
    assert_eq!(second.recv().await, Some(Bytes::from_static(b"response")));
    drop(first);
}

#[tokio::test]
async fn pool_keeps_interleaved_consumers_apart() {
    let wires = wiring(ClientType::Widget);
    let observer = RecordingObserver::new();
    let engine = Engine::boot(&options(ClientType::Widget, 2, 1), &wires.transports, observer.clone()).unwrap();
    engine.start();

    let mut first = wires.consumers.remote(0).await.unwrap();
    let mut second = wires.consumers.remote(1).await.unwrap();
    let mut relay = wires.producers.remote(0).await.unwrap();
    let consumers = engine.consumer_table().clone();
    let producers = engine.producer_table().clone();
    assert!(eventually(|| producers.is_usable(0) && consumers.is_usable(0) && consumers.is_usable(1)).await);

    first.send(Bytes::from_static(b"req-from-0")).await;
    assert_eq!(relay.recv().await, Some(Bytes::from_static(b"req-from-0")));
    second.send(Bytes::from_static(b"req-from-1")).await;

    relay.send(Bytes::from_static(b"reply-for-0")).await;
    assert_eq!(first.recv().await, Some(Bytes::from_static(b"reply-for-0")));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(second.try_recv(), None, "a reply crossed over to the other consumer");
    assert_eq!(relay.try_recv(), None, "the relay slot served two consumers at once");
    assert_eq!(engine.snapshot().producer.bindings, vec![Some(0)]);

    // Once the first consumer is gone the slot serves the second one.
    wires.consumers.script(0, [Outcome::Fail; 100]);
    first.fail();
    assert_eq!(relay.recv().await, Some(Bytes::from_static(b"req-from-1")));
    assert_eq!(engine.snapshot().producer.bindings, vec![Some(1)]);
    relay.send(Bytes::from_static(b"reply-for-1")).await;
    assert_eq!(second.recv().await, Some(Bytes::from_static(b"reply-for-1")));
}

#[tokio::test]
async fn serial_lane_keeps_units_in_order() {
    let wires = wiring(ClientType::Desktop);
    let engine = Engine::boot(&options(ClientType::Desktop, 1, 1), &wires.transports, RecordingObserver::new()).unwrap();
    engine.start();

    let app = wires.consumers.remote(0).await.unwrap();
    let mut peer = wires.producers.remote(0).await.unwrap();
    for i in 0..20 {
        app.send(unit(i)).await;
    }
    for i in 0..20 {
        assert_eq!(peer.recv().await, Some(unit(i)));
    }
}

#[tokio::test]
async fn small_bus_applies_backpressure_without_loss() {
    let wires = wiring(ClientType::Desktop);
    let mut opts = options(ClientType::Desktop, 1, 1);
    opts.engine.bus_buffer_sz = 1;
    let engine = Engine::boot(&opts, &wires.transports, RecordingObserver::new()).unwrap();
    assert_eq!(engine.snapshot().bus_capacity, 1);
    engine.start();

    let app = wires.consumers.remote(0).await.unwrap();
    let mut peer = wires.producers.remote(0).await.unwrap();
    let sender = tokio::spawn(async move {
        for i in 0..40 {
            app.send(unit(i)).await;
        }
        app
    });
    for i in 0..40 {
        assert_eq!(peer.recv().await, Some(unit(i)));
    }
    let _app = sender.await.unwrap();
}
