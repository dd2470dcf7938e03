//! Rendezvous-server candidates from the published public list.

use async_trait::async_trait;
use rand::seq::IndexedRandom;

use super::ky_http::ApiClient;
use crate::configs::RealtimeOptions;
use crate::error::{ConfigError, LinkError};
use crate::transports::realtime::CandidateSource;

/// Fetches the list (one `host:port` per line) on every batch and samples
/// `size` distinct entries from it.
#[derive(Debug, Clone)]
pub struct HttpCandidateSource {
    client: ApiClient,
}

impl HttpCandidateSource {
    pub fn new(list_url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            client: ApiClient::new(list_url)?,
        })
    }

    pub fn from_options(options: &RealtimeOptions) -> Result<Self, ConfigError> {
        Self::new(&options.stun_list_url)
    }
}

/// Turns the raw list into `stun:` URLs, skipping blank lines.
pub(crate) fn parse_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| format!("stun:{line}"))
        .collect()
}

#[async_trait]
impl CandidateSource for HttpCandidateSource {
    async fn batch(&self, size: u32) -> Result<Vec<String>, LinkError> {
        let text = self.client.get_text("").await?;
        let candidates = parse_list(&text);
        if candidates.is_empty() {
            return Err(LinkError::Candidates("published list is empty".into()));
        }
        let batch: Vec<String> = candidates
            .choose_multiple(&mut rand::rng(), size as usize)
            .cloned()
            .collect();
        tracing::trace!(available = candidates.len(), picked = batch.len(), "candidate batch sampled");
        Ok(batch)
    }
}
