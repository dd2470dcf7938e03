//! # Transports
//!
//! Everything a worker needs to turn a slot into a working link. Each
//! [`WorkerKind`] is backed by one [`Connector`]; a connector performs one
//! negotiation attempt per call and either yields a [`Link`] or a
//! [`LinkError`]. Timeout budgets are applied inside the connectors so that
//! the worker state machine only sees "established" or "failed".
//!
//! ## Contained Modules:
//!
//! - **`local_stream`**: the local proxy endpoint the application talks to.
//! - **`realtime`**: the peer-to-peer negotiation (candidates, signaling,
//!   session establishment) shared by both realtime kinds.
//! - **`direct_tcp`**: a [`realtime::PeerTransport`] for directly reachable
//!   peers.
//! - **`relay`**: the WebSocket dialer for the egress relay.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{BytesCodec, Framed};

use crate::configs::{BootRecipe, ClientOptions};
use crate::core::state::WorkerKind;
use crate::error::{ConfigError, LinkError};
use crate::retrieve::{HttpCandidateSource, HttpSignaling};

pub mod direct_tcp;
pub mod local_stream;
pub mod realtime;
pub mod relay;

pub use direct_tcp::DirectTcpTransport;
pub use local_stream::LocalStreamConnector;
pub use realtime::{PeerSession, PeerTransport, RealtimeConnector};
pub use relay::RelayConnector;

/// Write half of a link.
pub type LinkSink = Pin<Box<dyn Sink<Bytes, Error = LinkError> + Send>>;
/// Read half of a link. The stream ending means the remote closed.
pub type LinkStream = BoxStream<'static, Result<Bytes, LinkError>>;

/// An established, bidirectional byte link.
pub struct Link {
    pub sink: LinkSink,
    pub stream: LinkStream,
    /// Where the remote end is, when the transport can tell.
    pub location: Option<String>,
}

impl Link {
    /// Frames any async byte stream as a link. Chunk boundaries follow
    /// whatever the underlying reads return.
    pub fn from_io<T>(io: T, location: Option<String>) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (sink, stream) = Framed::new(io, BytesCodec::new()).split::<Bytes>();
        Self {
            sink: Box::pin(sink.sink_map_err(LinkError::from)),
            stream: stream
                .map_ok(BytesMut::freeze)
                .map_err(LinkError::from)
                .boxed(),
            location,
        }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// One negotiation attempt for a slot.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Establishes a link for `slot`. Called again after every failure.
    async fn connect(&self, slot: usize) -> Result<Link, LinkError>;

    /// The local endpoint this connector listens on, if it listens at all.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Connectors keyed by worker kind, handed to the engine at boot.
#[derive(Clone, Default)]
pub struct Transports {
    connectors: HashMap<WorkerKind, Arc<dyn Connector>>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the connector for `kind`.
    pub fn with(mut self, kind: WorkerKind, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(kind, connector);
        self
    }

    /// Builds the production connectors for every kind the client type's
    /// recipe uses. Binds the local proxy endpoint when the recipe needs
    /// one, so it must run inside a tokio runtime.
    pub fn from_options(options: &ClientOptions) -> Result<Self, ConfigError> {
        let recipe = BootRecipe::for_client(options.engine.client_type);
        let mut transports = Self::new();
        for kind in recipe.kinds() {
            let connector: Arc<dyn Connector> = match kind {
                WorkerKind::LocalStream => {
                    let addr = options.local.bind_addr();
                    let connector = LocalStreamConnector::bind(addr).map_err(|source| ConfigError::Bind { addr, source })?;
                    Arc::new(connector)
                }
                WorkerKind::RealtimeConsumer | WorkerKind::RealtimeProducer => Arc::new(RealtimeConnector::new(
                    kind,
                    (&options.realtime).into(),
                    Arc::new(HttpCandidateSource::from_options(&options.realtime)?),
                    Arc::new(HttpSignaling::from_options(&options.realtime)?),
                    Arc::new(DirectTcpTransport::new(options.realtime.bind_addr)),
                )),
                WorkerKind::RelayConsumer => Arc::new(RelayConnector::from_options(&options.relay)?),
            };
            transports = transports.with(kind, connector);
        }
        Ok(transports)
    }

    pub fn connector(&self, kind: WorkerKind) -> Result<Arc<dyn Connector>, ConfigError> {
        self.connectors
            .get(&kind)
            .cloned()
            .ok_or(ConfigError::MissingConnector(kind))
    }
}

impl fmt::Debug for Transports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.connectors.keys()).finish()
    }
}
