//! # Error Types
//!
//! Three families of errors exist in the client:
//!
//! - [`ConfigError`] is the only error that escapes [`crate::core::Engine::boot`].
//!   Misconfiguration is fatal: nothing is started when it occurs.
//! - [`LinkError`] describes why a connection attempt or an established link
//!   failed. It never leaves a worker; it drives the worker into `Failing`
//!   and is logged.
//! - [`RouterError`] is raised when a router is attached to a table whose
//!   slot readers were already claimed.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::state::{TableRole, WorkerKind};

/// Construction-time misconfiguration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid client type '{0}' (expected 'desktop' or 'widget')")]
    InvalidClientType(String),

    #[error("{table} table size must be at least 1")]
    EmptyTable { table: TableRole },

    #[error("bus buffer size must be at least 1")]
    EmptyBus,

    #[error("serial router needs between 1 and {producers} lanes, got {lanes}")]
    LaneCount { lanes: usize, producers: usize },

    #[error("no connector registered for worker kind {0}")]
    MissingConnector(WorkerKind),

    #[error("invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to read options file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse options file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("failed to bind the local endpoint {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("the engine must be booted from within a tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Router(#[from] RouterError),
}

/// Failure while negotiating or using a link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{stage} did not finish within {after:?}")]
    Timeout { stage: &'static str, after: Duration },

    #[error("candidate fetch failed: {0}")]
    Candidates(String),

    #[error("signaling failed: {0}")]
    Signaling(String),

    #[error("remote rejected the session: {0}")]
    Rejected(String),

    #[error("remote end closed the link")]
    RemoteClosed,

    #[error("worker stopped")]
    Stopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest_middleware::Error),
}

impl From<reqwest::Error> for LinkError {
    fn from(e: reqwest::Error) -> Self {
        LinkError::Http(reqwest_middleware::Error::Reqwest(e))
    }
}

/// Router attachment failure.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("slot {slot} of the {table} table already has a router attached")]
    ReaderTaken { table: TableRole, slot: usize },

    #[error("the {0} router was already initialized")]
    AlreadyInitialized(TableRole),
}
