//! CLI configuration: defaults, then the first config file found, then environment.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;
use zts_core::NetworkId;

/// Demo configuration. File: ~/.config/zts/cli.toml or /etc/zts/cli.toml.
/// Env overrides: ZTS_CLI_NETWORK, ZTS_CLI_ECHO_PORT, ZTS_CLI_PAYLOAD_SIZE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CliConfig {
    /// Network the demo nodes join, 16 hex digits.
    #[serde(default = "default_network")]
    pub network: String,
    /// IPv4 pool handed out on that network.
    #[serde(default = "default_ipv4_net")]
    pub ipv4_net: Ipv4Addr,
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
    /// Port of the echo listener (default 7000).
    #[serde(default = "default_echo_port")]
    pub echo_port: u16,
    /// Bytes per echo round (default 16 KiB).
    #[serde(default = "default_payload_size")]
    pub payload_size: usize,
}

fn default_network() -> String {
    "8056c2e21c000001".to_owned()
}
fn default_ipv4_net() -> Ipv4Addr {
    Ipv4Addr::new(10, 147, 17, 0)
}
fn default_prefix_len() -> u8 {
    24
}
fn default_echo_port() -> u16 {
    7000
}
fn default_payload_size() -> usize {
    16 * 1024
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            ipv4_net: default_ipv4_net(),
            prefix_len: default_prefix_len(),
            echo_port: default_echo_port(),
            payload_size: default_payload_size(),
        }
    }
}

impl CliConfig {
    pub fn network_id(&self) -> anyhow::Result<NetworkId> {
        self.network
            .parse()
            .with_context(|| format!("bad network id {:?}", self.network))
    }
}

/// Load config: defaults, then config file (if present), then env vars.
pub fn load() -> anyhow::Result<CliConfig> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(p) => {
            let s = std::fs::read_to_string(&p).with_context(|| format!("read {}", p.display()))?;
            parse(&s).with_context(|| format!("parse {}", p.display()))?
        }
        None => CliConfig::default(),
    };
    if let Ok(s) = std::env::var("ZTS_CLI_NETWORK") {
        c.network = s;
    }
    if let Ok(s) = std::env::var("ZTS_CLI_ECHO_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.echo_port = p;
        }
    }
    if let Ok(s) = std::env::var("ZTS_CLI_PAYLOAD_SIZE") {
        if let Ok(n) = s.parse::<usize>() {
            c.payload_size = n;
        }
    }
    c.network_id()?;
    Ok(c)
}

fn parse(s: &str) -> anyhow::Result<CliConfig> {
    Ok(toml::from_str::<CliConfig>(s)?)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/zts/cli.toml"));
    }
    out.push(PathBuf::from("/etc/zts/cli.toml"));
    out
}
