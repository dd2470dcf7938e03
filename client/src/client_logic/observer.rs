use std::time::Duration;

use lib_peer::{LogObserver, Observer, TableRole, WorkerState};
use tokio::sync::watch;

/// Logs every notification and counts readiness announcements so that
/// `main` can wait for a stop to complete.
pub struct ClientObserver {
    log: LogObserver,
    ready: watch::Sender<u64>,
}

impl Default for ClientObserver {
    fn default() -> Self {
        Self {
            log: LogObserver,
            ready: watch::Sender::new(0),
        }
    }
}

impl ClientObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready(&self) -> watch::Receiver<u64> {
        self.ready.subscribe()
    }
}

impl Observer for ClientObserver {
    fn on_ready(&self) {
        self.log.on_ready();
        self.ready.send_modify(|n| *n += 1);
    }

    fn on_startup(&self) {
        self.log.on_startup();
    }

    fn on_downstream_chunk(&self, size: usize, slot: usize) {
        self.log.on_downstream_chunk(size, slot);
    }

    fn on_downstream_throughput(&self, bytes_per_sec: u64) {
        self.log.on_downstream_throughput(bytes_per_sec);
    }

    fn on_consumer_connection_change(&self, state: WorkerState, slot: usize, location: Option<&str>) {
        self.log.on_consumer_connection_change(state, slot, location);
    }

    fn on_routing_starved(&self, table: TableRole, waited: Duration) {
        self.log.on_routing_starved(table, waited);
    }
}
