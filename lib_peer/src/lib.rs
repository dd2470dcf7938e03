//! Core library of the peer-assisted network client.
//!
//! Two fixed-size worker tables (one facing whoever consumes connectivity,
//! one facing whoever produces it) are joined by a bounded bidirectional
//! event bus, with a routing discipline on each side. The [`Engine`] boots
//! the whole arrangement from a per-client-type recipe.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

// Declare the modules
pub mod configs;
pub mod core;
pub mod error;
pub mod loggers; // tracing subscriber setup and log file pruning
pub mod observer;
pub mod retrieve; // HTTP clients for candidates and signaling
pub mod transports;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export the everyday surface
pub use crate::configs::{BootRecipe, ClientOptions, ClientType, Discipline, EngineOptions};
pub use crate::core::{BusMessage, Engine, EngineSnapshot, TableRole, WorkerKind, WorkerState, WorkerTable};
pub use crate::error::{ConfigError, LinkError, RouterError};
pub use crate::loggers::{init_tracing, LogOptions};
pub use crate::observer::{LogObserver, Observer};
pub use crate::transports::{Connector, Link, Transports};
