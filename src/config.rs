use crate::relay::RelayMode;
use serde::Deserialize;
use std::path::Path;

/// Global configuration for the fleet manager
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server and naming configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Fleet and forwarder configuration
    #[serde(default)]
    pub fleet: FleetConfig,

    /// Background scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Proxy-rental provider API configuration
    #[serde(default)]
    pub provider: ProviderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the forwarder listeners bind to (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Public domain the gateway routes subdomains under
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Hostname the gateway uses to reach the forwarders
    #[serde(default = "default_backend_host")]
    pub backend_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            domain: default_domain(),
            backend_host: default_backend_host(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FleetConfig {
    /// Path of the flat-file fleet state (default: ./data/fleet.json)
    #[serde(default = "default_data_file")]
    pub data_file: String,

    /// Path of the gateway's dynamic routing file (default: ./gateway/routes.yml)
    #[serde(default = "default_gateway_file")]
    pub gateway_file: String,

    /// First port of the 100-wide allocation window (default: 9000)
    #[serde(default = "default_port_window_start")]
    pub port_window_start: u16,

    /// Relay style used by every forwarder (default: raw)
    #[serde(default)]
    pub relay_mode: RelayMode,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            data_file: default_data_file(),
            gateway_file: default_gateway_file(),
            port_window_start: default_port_window_start(),
            relay_mode: RelayMode::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    /// Seconds between health-check cycles (default: 30)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Seconds between rotation-policy cycles (default: 30)
    #[serde(default = "default_rotation_interval")]
    pub rotation_check_interval_secs: u64,

    /// Probe through the local forwarder port instead of the upstream
    /// endpoint directly (default: false)
    #[serde(default)]
    pub probe_through_forwarder: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval(),
            rotation_check_interval_secs: default_rotation_interval(),
            probe_through_forwarder: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Base URL of the rental provider API
    #[serde(default = "default_provider_base_url")]
    pub base_url: String,

    /// Request timeout in seconds (default: 30)
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_base_url(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_backend_host() -> String {
    "backend".to_string()
}

fn default_data_file() -> String {
    "./data/fleet.json".to_string()
}

fn default_gateway_file() -> String {
    "./gateway/routes.yml".to_string()
}

fn default_port_window_start() -> u16 {
    9000
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_rotation_interval() -> u64 {
    30
}

fn default_provider_base_url() -> String {
    "https://api.kiotproxy.com/api/v1".to_string()
}

fn default_provider_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from a TOML file; a missing file yields the
    /// built-in defaults so the daemon can start unconfigured.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.domain, "localhost");
        assert_eq!(config.fleet.port_window_start, 9000);
        assert_eq!(config.fleet.relay_mode, RelayMode::Raw);
        assert_eq!(config.scheduler.health_check_interval_secs, 30);
        assert!(!config.scheduler.probe_through_forwarder);
        assert_eq!(config.provider.timeout_secs, 30);
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
            [server]
            domain = "proxies.example.com"
            backend_host = "127.0.0.1"

            [fleet]
            port_window_start = 10000
            relay_mode = "http"

            [scheduler]
            health_check_interval_secs = 10
            probe_through_forwarder = true

            [provider]
            base_url = "http://127.0.0.1:4000/api/v1"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.domain, "proxies.example.com");
        assert_eq!(config.server.backend_host, "127.0.0.1");
        assert_eq!(config.fleet.port_window_start, 10000);
        assert_eq!(config.fleet.relay_mode, RelayMode::Http);
        assert_eq!(config.scheduler.health_check_interval_secs, 10);
        assert!(config.scheduler.probe_through_forwarder);
        assert_eq!(config.provider.base_url, "http://127.0.0.1:4000/api/v1");
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str("[server]\ndomain = \"x.io\"\n").unwrap();
        assert_eq!(config.server.domain, "x.io");
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.fleet.port_window_start, 9000);
    }
}
