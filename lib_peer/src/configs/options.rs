//! Option groups with their documented defaults.
//!
//! Every group is `#[serde(default)]`: a missing group, or a missing field
//! inside a group, falls back to the values below.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::state::TableRole;
use crate::error::ConfigError;

/// Which side of the network this client is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    /// Censored peer: consumes connectivity from free peers.
    #[default]
    Desktop,
    /// Free peer: shares its connectivity through the relay.
    Widget,
}

impl FromStr for ClientType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "desktop" => Ok(Self::Desktop),
            "widget" => Ok(Self::Widget),
            other => Err(ConfigError::InvalidClientType(other.to_string())),
        }
    }
}

impl std::fmt::Display for ClientType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Desktop => write!(f, "desktop"),
            Self::Widget => write!(f, "widget"),
        }
    }
}

/// Table sizing, bus capacity and retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub client_type: ClientType,
    pub c_table_size: usize,
    pub p_table_size: usize,
    pub bus_buffer_sz: usize,
    /// Network-state collector that consumer connection changes are reported to.
    pub netstated: Option<String>,
    /// Retries after consecutive failures before a slot closes for the boot
    /// cycle. Unbounded when absent; `0` closes on the first failure.
    pub max_retries: Option<u32>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long a router may hold a unit before the observer hears about it.
    pub starvation_threshold_ms: u64,
    /// Throughput notifications per second.
    pub ui_refresh_hz: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            client_type: ClientType::Desktop,
            c_table_size: 5,
            p_table_size: 5,
            bus_buffer_sz: 4096,
            netstated: None,
            max_retries: None,
            backoff_base_ms: 500,
            backoff_max_ms: 15_000,
            starvation_threshold_ms: 10_000,
            ui_refresh_hz: 4,
        }
    }
}

impl EngineOptions {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn starvation_threshold(&self) -> Duration {
        Duration::from_millis(self.starvation_threshold_ms)
    }
}

/// Realtime negotiation budgets and discovery endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeOptions {
    pub discovery_srv: String,
    pub endpoint: String,
    pub genesis_addr: String,
    pub nat_fail_timeout_ms: u64,
    pub ice_fail_timeout_ms: u64,
    pub stun_batch_size: u32,
    /// Published list of rendezvous servers, one `host:port` per line.
    pub stun_list_url: String,
    pub tag: String,
    /// Listen address of the direct transport.
    pub bind_addr: SocketAddr,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            discovery_srv: "https://broflake-freddie-xdy27ofj3a-ue.a.run.app".to_string(),
            endpoint: "/v1/signal".to_string(),
            genesis_addr: "genesis".to_string(),
            nat_fail_timeout_ms: 5_000,
            ice_fail_timeout_ms: 5_000,
            stun_batch_size: 5,
            stun_list_url: "https://raw.githubusercontent.com/pradt2/always-online-stun/master/valid_ipv4s.txt"
                .to_string(),
            tag: String::new(),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }
}

impl RealtimeOptions {
    pub fn nat_fail_timeout(&self) -> Duration {
        Duration::from_millis(self.nat_fail_timeout_ms)
    }

    pub fn ice_fail_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_fail_timeout_ms)
    }

    /// `discovery_srv` joined with `endpoint`.
    pub fn signal_url(&self) -> Result<Url, ConfigError> {
        join_url(&self.discovery_srv, &self.endpoint)
    }
}

/// Relay (egress) endpoint and dial timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayOptions {
    pub addr: String,
    pub endpoint: String,
    pub connect_timeout_ms: u64,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            addr: "wss://broflake-egress-xdy27ofj3a-ue.a.run.app".to_string(),
            endpoint: "/ws".to_string(),
            connect_timeout_ms: 5_000,
        }
    }
}

impl RelayOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn url(&self) -> Result<String, ConfigError> {
        join_url(&self.addr, &self.endpoint).map(String::from)
    }
}

/// The local proxy endpoint used by the local-stream worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalOptions {
    pub bind_host: IpAddr,
    pub proxy_port: u16,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            proxy_port: 1080,
        }
    }
}

impl LocalOptions {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.proxy_port)
    }
}

/// All option groups of one client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub engine: EngineOptions,
    pub realtime: RealtimeOptions,
    pub relay: RelayOptions,
    pub local: LocalOptions,
}

impl ClientOptions {
    /// Reads options from a JSON file. Absent groups keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks everything that does not depend on the boot recipe.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let e = &self.engine;
        if e.c_table_size == 0 {
            return Err(ConfigError::EmptyTable {
                table: TableRole::Consumer,
            });
        }
        if e.p_table_size == 0 {
            return Err(ConfigError::EmptyTable {
                table: TableRole::Producer,
            });
        }
        if e.bus_buffer_sz == 0 {
            return Err(ConfigError::EmptyBus);
        }
        if e.ui_refresh_hz == 0 {
            return Err(ConfigError::ZeroValue("ui_refresh_hz"));
        }
        if e.backoff_base_ms == 0 {
            return Err(ConfigError::ZeroValue("backoff_base_ms"));
        }
        if self.realtime.stun_batch_size == 0 {
            return Err(ConfigError::ZeroValue("stun_batch_size"));
        }
        if self.realtime.nat_fail_timeout_ms == 0 || self.realtime.ice_fail_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("realtime timeouts"));
        }
        if self.relay.connect_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("connect_timeout_ms"));
        }
        if let Some(url) = &e.netstated {
            Url::parse(url).map_err(|source| ConfigError::InvalidUrl {
                url: url.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

fn join_url(base: &str, endpoint: &str) -> Result<Url, ConfigError> {
    let invalid = |source| ConfigError::InvalidUrl {
        url: format!("{base}{endpoint}"),
        source,
    };
    Url::parse(base).and_then(|b| b.join(endpoint)).map_err(invalid)
}
