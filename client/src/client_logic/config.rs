use anyhow::{Context, Result};
use clap::Parser;
use lib_peer::{ClientOptions, ClientType, LogOptions};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Peer-assisted network access client", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "CLIENT_TYPE", help = "Client type: desktop (censored peer) or widget (free peer).")]
    pub client_type: Option<ClientType>,

    #[clap(long, env = "PEER_CONFIG_PATH", help = "Path to the JSON options file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PEER_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PEER_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PEER_LOG_JSON", help = "Write console logs as JSON lines.")]
    pub log_json: Option<bool>,

    #[clap(long, env = "NETSTATED", help = "Network-state collector URL.")]
    pub netstated: Option<String>,

    #[clap(long, env = "TAG", help = "Free-form tag attached to signaling and netstate reports.")]
    pub tag: Option<String>,

    #[clap(long, env = "PORT", help = "Local proxy port (desktop only).")]
    pub port: Option<u16>,

    #[clap(long, env = "C_TABLE_SIZE", help = "Consumer table size.")]
    pub c_table_size: Option<usize>,

    #[clap(long, env = "P_TABLE_SIZE", help = "Producer table size.")]
    pub p_table_size: Option<usize>,

    #[clap(long, env = "BUS_BUFFER_SZ", help = "Capacity of each event bus channel.")]
    pub bus_buffer_sz: Option<usize>,

    #[clap(long, env = "MAX_RETRIES", help = "Consecutive failures a worker tolerates before closing. Unbounded when unset.")]
    pub max_retries: Option<u32>,

    #[clap(long, env = "DISCOVERY_SRV", help = "Signaling server base URL.")]
    pub discovery_srv: Option<String>,

    #[clap(long, env = "EGRESS_ADDR", help = "Relay (egress) server base URL.")]
    pub egress_addr: Option<String>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            client_type: other.client_type.or(self.client_type),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_json: other.log_json.or(self.log_json),
            netstated: other.netstated.or(self.netstated),
            tag: other.tag.or(self.tag),
            port: other.port.or(self.port),
            c_table_size: other.c_table_size.or(self.c_table_size),
            p_table_size: other.p_table_size.or(self.p_table_size),
            bus_buffer_sz: other.bus_buffer_sz.or(self.bus_buffer_sz),
            max_retries: other.max_retries.or(self.max_retries),
            discovery_srv: other.discovery_srv.or(self.discovery_srv),
            egress_addr: other.egress_addr.or(self.egress_addr),
        }
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            level: self.log_level.clone().unwrap_or_else(|| "info".to_string()),
            json: self.log_json.unwrap_or(false),
            log_dir: self.log_dir.clone(),
            ..LogOptions::default()
        }
    }

    /// Engine options: the options file (when one exists) with every value
    /// given on the command line or in the environment laid over it.
    pub fn client_options(&self) -> Result<ClientOptions> {
        let mut options = match &self.config_path {
            Some(path) if path.exists() => ClientOptions::from_json_file(path)?,
            Some(path) => {
                tracing::info!("Options file not found at {}. Using defaults.", path.display());
                ClientOptions::default()
            }
            None => ClientOptions::default(),
        };

        if let Some(client_type) = self.client_type {
            options.engine.client_type = client_type;
        }
        if let Some(netstated) = self.netstated.as_ref().filter(|s| !s.is_empty()) {
            options.engine.netstated = Some(netstated.clone());
        }
        if let Some(tag) = &self.tag {
            options.realtime.tag = tag.clone();
        }
        if let Some(port) = self.port {
            options.local.proxy_port = port;
        }
        if let Some(size) = self.c_table_size {
            options.engine.c_table_size = size;
        }
        if let Some(size) = self.p_table_size {
            options.engine.p_table_size = size;
        }
        if let Some(size) = self.bus_buffer_sz {
            options.engine.bus_buffer_sz = size;
        }
        if self.max_retries.is_some() {
            options.engine.max_retries = self.max_retries;
        }
        if let Some(srv) = &self.discovery_srv {
            options.realtime.discovery_srv = srv.clone();
        }
        if let Some(addr) = &self.egress_addr {
            options.relay.addr = addr.clone();
        }

        options.validate().context("invalid client options")?;
        Ok(options)
    }
}

pub fn load_config() -> Config {
    load_config_from(std::env::args_os())
}

pub fn load_config_from<I, T>(args: I) -> Config
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    // 1. Load defaults
    let default_config = Config {
        config_path: Some(PathBuf::from("peer_client.json")),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ..Default::default()
    };

    // 2. Override with environment variables and CLI arguments
    default_config.merge(Config::parse_from(args))
}
