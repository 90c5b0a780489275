//! Controller configuration
//!
//! Plain value fields for the individual transports. Nothing here is
//! validated; each backend checks what it consumes.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::args::PtArgs;

/// Config holds the settings handed to transports on start
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub snowflake: SnowflakeConfig,
    pub tubesocks: TubeSocksConfig,
    pub v2ray: V2RayConfig,
    pub hysteria2: Hysteria2Config,
}

/// LogConfig controls the log file in the state directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Write the log to the state directory instead of stderr
    pub enable: bool,
    /// Log target addresses unscrubbed
    pub unsafe_logging: bool,
    /// ERROR, WARN, INFO, DEBUG or TRACE. Empty means ERROR
    pub level: String,
}

/// SnowflakeConfig carries the rendezvous settings for snowflake
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnowflakeConfig {
    /// Comma-separated ICE server list
    pub ice_servers: String,
    pub broker_url: String,
    /// Comma-separated domains for domain fronting or AMP cache rendezvous
    pub front_domains: String,
    pub amp_cache_url: String,
    pub sqs_url: String,
    pub sqs_creds: String,
    /// Multiplexed WebRTC peers, at least 1
    pub max_peers: u32,
}

/// Credentials for a TubeSocks front proxy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TubeSocksConfig {
    pub obfs4: Credentials,
    pub meek_lite: Credentials,
}

/// V2RayConfig is shared by the WebSocket and QUIC flavours
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct V2RayConfig {
    pub server_address: String,
    pub server_port: String,
    /// WebSocket path, only used by v2ray_ws
    pub ws_path: String,
    /// VMess user id
    pub id: String,
    pub allow_insecure: bool,
    pub server_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Hysteria2Config {
    /// Server URI, see the hysteria2 URI scheme
    pub server: String,
}

impl Config {
    /// load reads a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
        Self::from_json(&content)
    }

    /// from_json parses a JSON configuration string
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))
    }

    /// snowflake_args builds the extra arguments merged into every
    /// snowflake connection
    pub fn snowflake_args(&self) -> PtArgs {
        let sf = &self.snowflake;
        let mut args = PtArgs::new();
        args.set("fronts", sf.front_domains.as_str());
        args.set("ice", sf.ice_servers.as_str());
        args.set("max", sf.max_peers.max(1).to_string());
        args.set("url", sf.broker_url.as_str());
        args.set("ampcache", sf.amp_cache_url.as_str());
        args.set("sqsqueue", sf.sqs_url.as_str());
        args.set("sqscreds", sf.sqs_creds.as_str());
        args
    }
}
