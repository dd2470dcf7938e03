//! Signaling over HTTP long-poll.
//!
//! Every envelope is POSTed as JSON to `discovery_srv + endpoint`. The
//! response body, when present, is the next envelope addressed to the
//! sender; an empty body means nothing arrived before the server gave up
//! waiting.

use async_trait::async_trait;
use reqwest::Method;

use super::ky_http::ApiClient;
use crate::configs::RealtimeOptions;
use crate::error::{ConfigError, LinkError};
use crate::transports::realtime::{SignalEnvelope, Signaling};

#[derive(Debug, Clone)]
pub struct HttpSignaling {
    client: ApiClient,
    endpoint: String,
}

impl HttpSignaling {
    pub fn new(discovery_srv: &str, endpoint: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            client: ApiClient::new(discovery_srv)?,
            endpoint: endpoint.into(),
        })
    }

    pub fn from_options(options: &RealtimeOptions) -> Result<Self, ConfigError> {
        Self::new(&options.discovery_srv, options.endpoint.clone())
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    async fn exchange(&self, envelope: SignalEnvelope) -> Result<Option<SignalEnvelope>, LinkError> {
        tracing::trace!(from = %envelope.from, to = %envelope.to, kind = ?envelope.kind, "signaling");
        let resp = self
            .client
            .request::<SignalEnvelope, _>(Method::POST, &self.endpoint, Some(&envelope))
            .await?;
        if !resp.success {
            return Err(LinkError::Signaling(format!(
                "server answered {}: {}",
                resp.status,
                resp.error_body.unwrap_or_default()
            )));
        }
        Ok(resp.data)
    }
}
