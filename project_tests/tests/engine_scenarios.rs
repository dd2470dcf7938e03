//! # Engine Scenarios
//!
//! Whole-engine runs of the desktop recipe (one local stream, a serial bank
//! of realtime producers) over in-memory transports.

mod common;

use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::FutureExt;
use lib_peer::core::Readiness;
use lib_peer::testing::{Event, Outcome, RecordingObserver};
use lib_peer::{ClientType, Engine, WorkerState};

use common::{eventually, options, wiring};

fn lane(engine: &Engine) -> Option<usize> {
    engine.snapshot().producer.bindings.first().copied().flatten()
}

#[tokio::test]
async fn serial_start_binds_the_lowest_connected_slot() {
    let wires = wiring(ClientType::Desktop);
    for slot in [0, 1, 3, 4] {
        wires.producers.script(slot, [Outcome::Hang]);
    }
    let observer = RecordingObserver::new();
    let engine = Engine::boot(&options(ClientType::Desktop, 1, 5), &wires.transports, observer.clone()).unwrap();
    assert_eq!(engine.consumer_table().size(), 1);
    assert_eq!(engine.producer_table().size(), 5);

    engine.start();
    let mut app = wires.consumers.remote(0).await.unwrap();
    let mut peer = wires.producers.remote(2).await.unwrap();
    assert!(eventually(|| lane(&engine) == Some(2)).await);

    app.send(Bytes::from_static(b"CONNECT example.org:443")).await;
    assert_eq!(peer.recv().await, Some(Bytes::from_static(b"CONNECT example.org:443")));
    peer.send(Bytes::from_static(b"200")).await;
    assert_eq!(app.recv().await, Some(Bytes::from_static(b"200")));

    engine.stop();
    let consumer = engine.consumer_table().settled().await;
    let producer = engine.producer_table().settled().await;
    assert_eq!(consumer, vec![(0, Readiness::Connected)]);
    assert_eq!(
        producer,
        vec![
            (0, Readiness::Closed),
            (1, Readiness::Closed),
            (2, Readiness::Connected),
            (3, Readiness::Closed),
            (4, Readiness::Closed),
        ]
    );
    for slot in 0..5 {
        assert_eq!(wires.producers.attempts(slot), 1, "slot {slot} negotiated more than once");
    }
}

#[tokio::test]
async fn failed_serial_slot_hands_over_without_losing_units() {
    let wires = wiring(ClientType::Desktop);
    let observer = RecordingObserver::new();
    let engine = Engine::boot(&options(ClientType::Desktop, 1, 4), &wires.transports, observer.clone()).unwrap();
    engine.start();

    let app = wires.consumers.remote(0).await.unwrap();
    let mut peers = Vec::new();
    for slot in 0..4 {
        peers.push(Some(wires.producers.remote(slot).await.unwrap()));
    }
    let table = engine.producer_table().clone();
    assert!(eventually(|| table.states().iter().all(|s| *s == WorkerState::Active)).await);
    assert!(eventually(|| lane(&engine).is_some()).await);
    let bound = lane(&engine).unwrap();

    app.send(Bytes::from_static(b"first")).await;
    let mut bound_peer = peers[bound].take().unwrap();
    assert_eq!(bound_peer.recv().await, Some(Bytes::from_static(b"first")));

    // Keep the failed slot down while the lane moves on.
    wires.producers.script(bound, [Outcome::Fail; 100]);
    bound_peer.fail();
    let next = (0..4).find(|s| *s != bound).unwrap();

    for unit in [&b"second"[..], b"third", b"fourth"] {
        app.send(Bytes::copy_from_slice(unit)).await;
    }
    let next_peer = peers[next].as_mut().unwrap();
    for unit in [&b"second"[..], b"third", b"fourth"] {
        assert_eq!(next_peer.recv().await, Some(Bytes::copy_from_slice(unit)));
    }
    assert_eq!(lane(&engine), Some(next));

    for (slot, peer) in peers.iter_mut().enumerate() {
        if let Some(peer) = peer.as_mut() {
            if slot != next {
                assert_eq!(peer.try_recv(), None, "slot {slot} received a unit it was not bound for");
            }
        }
    }
    assert!(engine.producer_table().state(bound) != Some(WorkerState::Active));
}

#[tokio::test]
async fn stop_during_negotiation_settles_before_announcing_readiness() {
    let wires = wiring(ClientType::Desktop);
    wires.producers.script(1, [Outcome::Hang]);
    wires.producers.script(2, [Outcome::Hang]);
    let observer = RecordingObserver::new();
    let engine = Engine::boot(&options(ClientType::Desktop, 1, 3), &wires.transports, observer.clone()).unwrap();
    assert_eq!(observer.events(), vec![Event::Ready, Event::Startup]);

    engine.start();
    let _app = wires.consumers.remote(0).await.unwrap();
    let _peer = wires.producers.remote(0).await.unwrap();
    let table = engine.producer_table().clone();
    assert!(
        eventually(|| {
            table.state(1) == Some(WorkerState::Negotiating) && table.state(2) == Some(WorkerState::Negotiating)
        })
        .await
    );

    let began = Instant::now();
    engine.stop();
    assert!(began.elapsed() < Duration::from_millis(50), "stop must not wait for the tables");

    assert!(
        observer
            .wait_until(|events| events.iter().filter(|e| **e == Event::Ready).count() == 2)
            .await
    );
    let consumer = engine.consumer_table().settled().now_or_never();
    let producer = engine.producer_table().settled().now_or_never();
    assert_eq!(consumer, Some(vec![(0, Readiness::Connected)]));
    assert_eq!(
        producer,
        Some(vec![(0, Readiness::Connected), (1, Readiness::Closed), (2, Readiness::Closed)])
    );
    assert!(engine.producer_table().states().iter().all(|s| *s == WorkerState::Closed));
}

#[tokio::test]
async fn consumer_connection_changes_reach_the_observer() {
    let wires = wiring(ClientType::Desktop);
    let observer = RecordingObserver::new();
    let engine = Engine::boot(&options(ClientType::Desktop, 1, 2), &wires.transports, observer.clone()).unwrap();
    engine.start();

    let app = wires.consumers.remote(0).await.unwrap();
    let up = Event::ConsumerConnectionChange {
        state: WorkerState::Active,
        slot: 0,
        location: Some("memory:0".to_string()),
    };
    assert!(observer.wait_until(|events| events.contains(&up)).await);

    app.fail();
    assert!(
        observer
            .wait_until(|events| events.iter().any(|e| matches!(
                e,
                Event::ConsumerConnectionChange {
                    state: WorkerState::Failing,
                    slot: 0,
                    ..
                }
            )))
            .await
    );
    // The local stream comes back on the next application connection.
    let _app = wires.consumers.remote(0).await.unwrap();
    assert!(observer.wait_until(|events| events.iter().filter(|e| **e == up).count() == 2).await);
}

#[tokio::test]
async fn failed_negotiations_of_a_consumer_are_not_reported_as_drops() {
    let wires = wiring(ClientType::Desktop);
    wires.consumers.script(0, [Outcome::Fail; 3]);
    let observer = RecordingObserver::new();
    let engine = Engine::boot(&options(ClientType::Desktop, 1, 1), &wires.transports, observer.clone()).unwrap();
    engine.start();

    let _app = wires.consumers.remote(0).await.unwrap();
    assert!(
        observer
            .wait_until(|events| events.iter().any(|e| matches!(
                e,
                Event::ConsumerConnectionChange {
                    state: WorkerState::Active,
                    ..
                }
            )))
            .await
    );
    assert_eq!(wires.consumers.attempts(0), 4);
    let changes: Vec<WorkerState> = observer
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::ConsumerConnectionChange { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(changes, vec![WorkerState::Active]);
}

#[tokio::test]
async fn units_queued_behind_a_failing_serial_slot_are_handed_over() {
    let wires = wiring(ClientType::Desktop);
    let engine = Engine::boot(&options(ClientType::Desktop, 1, 3), &wires.transports, RecordingObserver::new()).unwrap();
    engine.start();

    let app = wires.consumers.remote(0).await.unwrap();
    let mut peers = Vec::new();
    for slot in 0..3 {
        peers.push(Some(wires.producers.remote(slot).await.unwrap()));
    }
    let table = engine.producer_table().clone();
    assert!(eventually(|| table.states().iter().all(|s| *s == WorkerState::Active)).await);
    assert!(eventually(|| lane(&engine).is_some()).await);
    let bound = lane(&engine).unwrap();
    let next = (0..3).find(|s| *s != bound).unwrap();
    wires.producers.script(bound, [Outcome::Fail; 100]);

    let unit = |i: usize| Bytes::from(format!("unit-{i:02}"));
    let mut bound_peer = peers[bound].take().unwrap();
    app.send(unit(0)).await;
    let mut delivered = vec![bound_peer.recv().await.unwrap()];

    // The rest is still on its way through the engine when the slot dies.
    for i in 1..30 {
        app.send(unit(i)).await;
    }
    while let Some(payload) = bound_peer.try_recv() {
        delivered.push(payload);
    }
    bound_peer.fail();

    let before_failure = delivered.len();
    let next_peer = peers[next].as_mut().unwrap();
    while delivered.len() < 30 {
        match next_peer.recv().await {
            Some(payload) => delivered.push(payload),
            None => break,
        }
    }
    assert_eq!(delivered, (0..30).map(unit).collect::<Vec<_>>());
    assert!(before_failure < 30, "no unit was queued when the slot failed");
    assert_eq!(lane(&engine), Some(next));
}
