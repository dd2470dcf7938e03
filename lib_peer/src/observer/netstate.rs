//! Reports consumer connection changes to a network-state collector.

use serde::Serialize;
use tokio::runtime::Handle;

use crate::error::ConfigError;
use crate::retrieve::ApiClient;

/// Body of one report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetstateReport {
    pub tag: String,
    pub worker_idx: usize,
    /// `1` for up, `-1` for down.
    pub state: i8,
    pub loc: String,
}

/// Fire-and-forget reporter. A failed report is logged and forgotten.
#[derive(Debug, Clone)]
pub struct NetstateReporter {
    client: ApiClient,
    tag: String,
    handle: Handle,
}

impl NetstateReporter {
    pub fn new(url: &str, tag: impl Into<String>, handle: Handle) -> Result<Self, ConfigError> {
        Ok(Self {
            client: ApiClient::new(url)?,
            tag: tag.into(),
            handle,
        })
    }

    pub fn report_for(&self, signal: i8, slot: usize, location: Option<&str>) -> NetstateReport {
        NetstateReport {
            tag: self.tag.clone(),
            worker_idx: slot,
            state: signal,
            loc: location.unwrap_or_default().to_string(),
        }
    }

    /// Posts an up (`1`) or down (`-1`) edge in the background.
    pub fn report(&self, signal: i8, slot: usize, location: Option<&str>) {
        let report = self.report_for(signal, slot, location);
        let client = self.client.clone();
        self.handle.spawn(async move {
            match client.request::<serde_json::Value, _>(reqwest::Method::POST, "", Some(&report)).await {
                Ok(resp) if resp.success => tracing::trace!(slot = report.worker_idx, "netstate reported"),
                Ok(resp) => tracing::debug!(status = resp.status, "netstate collector refused report"),
                Err(e) => tracing::debug!(error = %e, "netstate report failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_carry_tag_and_signal() {
        let reporter = NetstateReporter::new("http://127.0.0.1:9/", "op-tag", Handle::current()).unwrap();
        let up = reporter.report_for(1, 2, Some("10.0.0.1"));
        assert_eq!(
            up,
            NetstateReport {
                tag: "op-tag".into(),
                worker_idx: 2,
                state: 1,
                loc: "10.0.0.1".into(),
            }
        );
        let down = reporter.report_for(-1, 0, None);
        assert_eq!((down.state, down.loc.as_str()), (-1, ""));
    }
}
