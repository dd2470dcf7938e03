//! # Client Configuration
//!
//! Plain option groups with documented defaults ([`options`]) and the
//! declarative per-client-type topology ([`recipe`]). Nothing here touches
//! process state: the binary layers files, environment and flags on top of
//! [`ClientOptions::default`] and hands the result to the engine.

pub mod options;
pub mod recipe;

pub use options::{ClientOptions, ClientType, EngineOptions, LocalOptions, RealtimeOptions, RelayOptions};
pub use recipe::{BootRecipe, Discipline, TableRecipe, TableSize};
