use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use ws_bridge::{BridgeConfig, SessionSettings};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
        }
    }
}

/// Per-client session tuning. A value of `0` seconds disables the
/// corresponding timer.
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default)]
    pub close_client_on_upstream_end: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: default_keepalive(),
            connect_timeout_secs: default_connect_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            max_header_bytes: default_max_header_bytes(),
            close_client_on_upstream_end: false,
        }
    }
}

impl SessionConfig {
    pub fn to_settings(&self) -> SessionSettings {
        SessionSettings {
            keepalive_interval: seconds(self.keepalive_interval_secs),
            connect_timeout: seconds(self.connect_timeout_secs),
            handshake_timeout: seconds(self.handshake_timeout_secs),
            max_header_bytes: self.max_header_bytes,
            close_client_on_upstream_end: self.close_client_on_upstream_end,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Apply the `--port` override: keep the configured host, swap the port.
    pub fn override_port(&mut self, port: u16) -> anyhow::Result<()> {
        let mut addr = self.listen_addr()?;
        addr.set_port(port);
        self.network.listen_addr = addr.to_string();
        Ok(())
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.network
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {:?}", self.network.listen_addr))
    }

    pub fn bridge_config(&self) -> anyhow::Result<BridgeConfig> {
        Ok(BridgeConfig {
            listen_addr: self.listen_addr()?,
            session: self.session.to_settings(),
        })
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_keepalive() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    15
}

fn default_max_header_bytes() -> usize {
    ntrip_proto::DEFAULT_MAX_HEADER_BYTES
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// Returns `None` when the file does not exist, so the bridge can start on
/// defaults. The caller reports that once logging is up.
pub fn load(path: &Path) -> anyhow::Result<Option<Config>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    parse(&contents)
        .map(Some)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn parse(contents: &str) -> anyhow::Result<Config> {
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yml::from_str(contents)?)
}
