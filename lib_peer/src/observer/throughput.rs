//! Downstream byte counting.
//!
//! The downstream handler adds every delivered chunk to a shared
//! [`ThroughputMeter`]; a ticker drains it `ui_refresh_hz` times per second
//! and reports the rate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::Observer;

#[derive(Debug, Default)]
pub struct ThroughputMeter {
    bytes: AtomicU64,
}

impl ThroughputMeter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes recorded since the last call.
    pub fn take(&self) -> u64 {
        self.bytes.swap(0, Ordering::Relaxed)
    }
}

/// Reports the meter's rate `hz` times per second until `shutdown`.
pub fn spawn_ticker(
    meter: Arc<ThroughputMeter>,
    observer: Arc<dyn Observer>,
    hz: u32,
    handle: &Handle,
    shutdown: CancellationToken,
) {
    let hz = hz.max(1);
    let period = Duration::from_secs(1) / hz;
    handle.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    observer.on_downstream_throughput(meter.take() * u64::from(hz));
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Rates(Mutex<Vec<u64>>);

    impl Observer for Rates {
        fn on_downstream_throughput(&self, bytes_per_sec: u64) {
            self.0.lock().unwrap().push(bytes_per_sec);
        }
    }

    #[test]
    fn take_resets_the_counter() {
        let meter = ThroughputMeter::new();
        meter.record(100);
        meter.record(28);
        assert_eq!(meter.take(), 128);
        assert_eq!(meter.take(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_scales_by_refresh_rate() {
        let meter = ThroughputMeter::new();
        let rates = Arc::new(Rates::default());
        let shutdown = CancellationToken::new();
        spawn_ticker(meter.clone(), rates.clone(), 4, &Handle::current(), shutdown.clone());

        // The first tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        meter.record(1_000);
        tokio::time::sleep(Duration::from_millis(250)).await;
        shutdown.cancel();

        let seen = rates.0.lock().unwrap().clone();
        assert_eq!(seen.first(), Some(&0));
        assert!(seen.contains(&4_000), "{seen:?}");
    }
}
