//! Local proxy endpoint for the local-stream worker.
//!
//! Each negotiation attempt accepts one application connection on the bound
//! endpoint. When the application hangs up the worker fails over into the
//! next attempt, which simply waits for the next connection.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use super::{Connector, Link};
use crate::error::LinkError;

pub struct LocalStreamConnector {
    listener: Mutex<TcpListener>,
    local_addr: SocketAddr,
}

impl LocalStreamConnector {
    /// Binds the local endpoint. Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "local proxy endpoint bound");
        Ok(Self {
            listener: Mutex::new(listener),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Connector for LocalStreamConnector {
    async fn connect(&self, slot: usize) -> Result<Link, LinkError> {
        let listener = self.listener.lock().await;
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::debug!(slot, %peer, "local application connected");
        Ok(Link::from_io(stream, Some(peer.to_string())))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}
