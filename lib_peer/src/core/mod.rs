//! # Core
//!
//! The worker-pool, routing and event-bus machinery.
//!
//! ## Contained Modules:
//!
//! - **`state`**: worker states, kinds, table roles and readiness.
//! - **`worker`**: the per-slot connection state machine.
//! - **`table`**: fixed-size banks of workers with start/stop boot cycles.
//! - **`routers`**: the consumer, serial and pool disciplines.
//! - **`bus`**: the bounded bidirectional event bus.
//! - **`engine`**: the composition root that boots everything from a recipe.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod bus;
pub mod engine;
pub mod routers;
pub mod state;
pub mod table;
pub mod worker;

pub use bus::{BusMessage, EventBus};
pub use engine::{Engine, EngineSnapshot};
pub use state::{Readiness, TableRole, WorkerKind, WorkerState};
pub use table::WorkerTable;

/// Locks a std mutex, carrying on with the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
