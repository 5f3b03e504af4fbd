//! Service configuration: defaults, then `<home>/zts.toml`, then environment.
//!
//! Env overrides: ZTS_STARTUP_TIMEOUT_MS, ZTS_TICK_INTERVAL_MS, ZTS_DEFAULT_NETWORK,
//! ZTS_MAX_SOCKETS, ZTS_CONNECT_TIMEOUT_MS.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, ZtsError};
use crate::model::NetworkId;

pub const CONFIG_FILE: &str = "zts.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// How long `start` waits for the node, stack and default network (default 30 s).
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Upper bound on driver sleep between ticks (default 10 ms).
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Network joined during `start`; `start` waits until it is ready.
    #[serde(default)]
    pub default_network: Option<String>,
    /// Socket table capacity (default 1024).
    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,
    /// Upper clamp for `listen` backlogs (default 128).
    #[serde(default = "default_max_backlog")]
    pub max_backlog: usize,
    /// Per-connection send buffer in bytes (default 64 KiB).
    #[serde(default = "default_buffer")]
    pub send_buffer: usize,
    /// Per-connection receive buffer in bytes (default 64 KiB).
    #[serde(default = "default_buffer")]
    pub recv_buffer: usize,
    /// Default connect timeout (default 20 s).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Pending event capacity between driver and callback (default 1024).
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}
fn default_tick_interval_ms() -> u64 {
    10
}
fn default_max_sockets() -> usize {
    1024
}
fn default_max_backlog() -> usize {
    128
}
fn default_buffer() -> usize {
    64 * 1024
}
fn default_connect_timeout_ms() -> u64 {
    20_000
}
fn default_event_queue_capacity() -> usize {
    1024
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            default_network: None,
            max_sockets: default_max_sockets(),
            max_backlog: default_max_backlog(),
            send_buffer: default_buffer(),
            recv_buffer: default_buffer(),
            connect_timeout_ms: default_connect_timeout_ms(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl ServiceConfig {
    /// Load: `base`, replaced by `<home>/zts.toml` when present, then env vars.
    pub fn load(base: ServiceConfig, home: &Path) -> Result<ServiceConfig> {
        let path = home.join(CONFIG_FILE);
        let mut c = if path.exists() {
            let s = std::fs::read_to_string(&path)
                .map_err(|e| ZtsError::Config(format!("{}: {e}", path.display())))?;
            Self::from_toml(&s)?
        } else {
            base
        };
        c.apply_env();
        c.validate()?;
        Ok(c)
    }

    pub fn from_toml(s: &str) -> Result<ServiceConfig> {
        toml::from_str::<ServiceConfig>(s).map_err(|e| ZtsError::Config(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_u64("ZTS_STARTUP_TIMEOUT_MS") {
            self.startup_timeout_ms = v;
        }
        if let Some(v) = env_u64("ZTS_TICK_INTERVAL_MS") {
            self.tick_interval_ms = v;
        }
        if let Ok(s) = std::env::var("ZTS_DEFAULT_NETWORK") {
            self.default_network = Some(s);
        }
        if let Some(v) = env_u64("ZTS_MAX_SOCKETS") {
            self.max_sockets = v as usize;
        }
        if let Some(v) = env_u64("ZTS_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sockets == 0 || self.max_sockets > i32::MAX as usize {
            return Err(ZtsError::Config("max_sockets out of range".into()));
        }
        if self.max_backlog == 0 {
            return Err(ZtsError::Config("max_backlog must be positive".into()));
        }
        if self.send_buffer == 0 || self.recv_buffer == 0 {
            return Err(ZtsError::Config("buffers must be positive".into()));
        }
        if self.event_queue_capacity == 0 {
            return Err(ZtsError::Config("event_queue_capacity must be positive".into()));
        }
        self.default_network_id()?;
        Ok(())
    }

    pub fn default_network_id(&self) -> Result<Option<NetworkId>> {
        match &self.default_network {
            None => Ok(None),
            Some(s) => s
                .parse::<NetworkId>()
                .map(Some)
                .map_err(|_| ZtsError::Config(format!("bad default_network {s:?}"))),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults() {
        let c = ServiceConfig::from_toml(
            "max_backlog = 4\ndefault_network = \"8056c2e21c000001\"\n",
        )
        .unwrap();
        assert_eq!(c.max_backlog, 4);
        assert_eq!(c.max_sockets, 1024);
        assert_eq!(
            c.default_network_id().unwrap(),
            Some(NetworkId(0x8056_c2e2_1c00_0001))
        );
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(matches!(
            ServiceConfig::from_toml("no_such_key = 1"),
            Err(ZtsError::Config(_))
        ));
    }

    #[test]
    fn missing_file_keeps_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = ServiceConfig {
            max_backlog: 7,
            ..ServiceConfig::default()
        };
        let c = ServiceConfig::load(base, dir.path()).unwrap();
        assert_eq!(c.max_backlog, 7);
    }

    #[test]
    fn invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "max_sockets = \"lots\"").unwrap();
        assert!(matches!(
            ServiceConfig::load(ServiceConfig::default(), dir.path()),
            Err(ZtsError::Config(_))
        ));
    }
}
