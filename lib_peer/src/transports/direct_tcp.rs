//! Direct TCP peer transport.
//!
//! Works between peers that can reach each other without NAT traversal: the
//! answering side listens and advertises `tcp:<ip>:<port>` in its answer, the
//! offering side dials that address. Rendezvous servers are accepted and
//! ignored.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::realtime::{PeerRole, PeerSession, PeerTransport};
use super::Link;
use crate::error::LinkError;

const SCHEME: &str = "tcp:";

#[derive(Debug, Clone)]
pub struct DirectTcpTransport {
    bind: SocketAddr,
}

impl DirectTcpTransport {
    pub fn new(bind: SocketAddr) -> Self {
        Self { bind }
    }

    /// Loopback-only transport on an ephemeral port.
    pub fn loopback() -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }

    fn advertised_ip(&self) -> Result<IpAddr, LinkError> {
        if !self.bind.ip().is_unspecified() {
            return Ok(self.bind.ip());
        }
        local_ip_address::local_ip().map_err(|e| LinkError::Io(io::Error::other(e.to_string())))
    }
}

#[async_trait]
impl PeerTransport for DirectTcpTransport {
    async fn open(&self, role: PeerRole, ice_servers: &[String]) -> Result<Box<dyn PeerSession>, LinkError> {
        tracing::trace!(?role, ignored = ice_servers.len(), "direct transport ignores rendezvous servers");
        match role {
            PeerRole::Answerer => {
                let listener = TcpListener::bind(self.bind).await?;
                let advertised = SocketAddr::new(self.advertised_ip()?, listener.local_addr()?.port());
                Ok(Box::new(DirectSession::Answering {
                    listener,
                    local: format!("{SCHEME}{advertised}"),
                }))
            }
            PeerRole::Offerer => Ok(Box::new(DirectSession::Offering { remote: None })),
        }
    }
}

enum DirectSession {
    Answering { listener: TcpListener, local: String },
    Offering { remote: Option<SocketAddr> },
}

fn parse_description(description: &str) -> Result<SocketAddr, LinkError> {
    description
        .strip_prefix(SCHEME)
        .and_then(|addr| addr.parse().ok())
        .ok_or_else(|| LinkError::Rejected(format!("unusable session description '{description}'")))
}

#[async_trait]
impl PeerSession for DirectSession {
    fn local_description(&self) -> String {
        match self {
            DirectSession::Answering { local, .. } => local.clone(),
            DirectSession::Offering { .. } => format!("{SCHEME}offer"),
        }
    }

    async fn apply_remote(&mut self, description: &str) -> Result<(), LinkError> {
        match self {
            DirectSession::Answering { .. } => {
                if description.starts_with(SCHEME) {
                    Ok(())
                } else {
                    Err(LinkError::Rejected(format!("unsupported offer '{description}'")))
                }
            }
            DirectSession::Offering { remote } => {
                *remote = Some(parse_description(description)?);
                Ok(())
            }
        }
    }

    async fn establish(self: Box<Self>) -> Result<Link, LinkError> {
        let (stream, peer) = match *self {
            DirectSession::Answering { listener, .. } => listener.accept().await?,
            DirectSession::Offering { remote } => {
                let remote = remote.ok_or_else(|| LinkError::Rejected("no answer applied".into()))?;
                (TcpStream::connect(remote).await?, remote)
            }
        };
        stream.set_nodelay(true)?;
        Ok(Link::from_io(stream, Some(peer.ip().to_string())))
    }
}
