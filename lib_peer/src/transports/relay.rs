//! # Relay Connector
//!
//! Dials the egress relay over a WebSocket. One dial per negotiation
//! attempt, bounded by the configured connect timeout. Binary and text
//! frames both carry payload; a close frame ends the link.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{future, SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::{Connector, Link};
use crate::configs::RelayOptions;
use crate::error::{ConfigError, LinkError};

pub struct RelayConnector {
    url: String,
    connect_timeout: Duration,
}

impl RelayConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }

    pub fn from_options(options: &RelayOptions) -> Result<Self, ConfigError> {
        Ok(Self::new(options.url()?, options.connect_timeout()))
    }
}

#[async_trait]
impl Connector for RelayConnector {
    async fn connect(&self, slot: usize) -> Result<Link, LinkError> {
        tracing::debug!(slot, url = %self.url, "dialing relay");
        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| LinkError::Timeout {
                stage: "relay connect",
                after: self.connect_timeout,
            })??;

        let (write, read) = ws.split();
        let sink = write
            .sink_map_err(LinkError::from)
            .with(|payload: Bytes| future::ready(Ok::<_, LinkError>(Message::Binary(payload))));
        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(payload)) => Some(Ok(payload)),
                Ok(Message::Text(text)) => Some(Ok(Bytes::copy_from_slice(text.as_bytes()))),
                Ok(Message::Close(_)) => Some(Err(LinkError::RemoteClosed)),
                Ok(_) => None,
                Err(e) => Some(Err(LinkError::from(e))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: stream.boxed(),
            location: None,
        })
    }
}
