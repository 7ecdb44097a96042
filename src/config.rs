//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `SECTUN_MQTT_ENDPOINT`, `SECTUN_CLIENT_ID`,
//!    `SECTUN_LOCAL_PROXY`
//! 2. **Config file** — path via `--config <path>`, or `sectun.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [mqtt]
//! endpoint = "a1xrd8yavpilkd-ats.iot.eu-west-2.example.com"
//! port = 8883
//! root_ca = "/etc/sectun/root.ca.bundle.pem"
//! cert = "/etc/sectun/device.certificate.pem"
//! key = "/etc/sectun/device.private.key"
//!
//! [device]
//! client_id = "tunnel-manager-001"
//!
//! [proxy]
//! local_proxy = "~/localproxy"
//! local_port = 2299
//!
//! [agent]
//! monitor_interval_secs = 30
//! get_timeout_secs = 5
//!
//! [broker]
//! url = "https://tunnel-broker.example.com"
//! region = "eu-west-2"
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// State-store (MQTT) connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname. Override with `SECTUN_MQTT_ENDPOINT`.
    #[serde(default)]
    pub endpoint: String,
    /// TLS port (default 8883).
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Root CA bundle path.
    #[serde(default)]
    pub root_ca: String,
    /// Device certificate path.
    #[serde(default)]
    pub cert: String,
    /// Device private key path.
    #[serde(default)]
    pub key: String,
    /// MQTT keep-alive in seconds (default 30).
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Seconds to wait for the broker to accept the connection (default 10).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Device identity on the state store.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Unique device client id. Override with `SECTUN_CLIENT_ID`.
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

/// Local tunnel-proxy executable settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Path to the proxy executable. Override with `SECTUN_LOCAL_PROXY`.
    /// A leading `~` is expanded.
    #[serde(default = "default_local_proxy")]
    pub local_proxy: String,
    /// Local listen port for source-mode proxies (default 2299).
    #[serde(default = "default_local_port")]
    pub local_port: u16,
}

/// Agent supervision settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Seconds between supervision cycles (default 30).
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
    /// Seconds to wait for the startup shadow GET response before logging a
    /// timeout (default 5).
    #[serde(default = "default_get_timeout")]
    pub get_timeout_secs: u64,
}

/// Tunnel-brokering service settings (Controller only).
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Base URL of the brokering service. Required for `sectun open`.
    #[serde(default)]
    pub url: String,
    /// Region tunnels are brokered in (default `eu-west-2`).
    #[serde(default = "default_region")]
    pub region: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_mqtt_port() -> u16 {
    8883
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_client_id() -> String {
    "tunnel-manager-001".to_string()
}
fn default_local_proxy() -> String {
    "./localproxy".to_string()
}
fn default_local_port() -> u16 {
    2299
}
fn default_monitor_interval() -> u64 {
    30
}
fn default_get_timeout() -> u64 {
    5
}
fn default_region() -> String {
    "eu-west-2".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            port: default_mqtt_port(),
            root_ca: String::new(),
            cert: String::new(),
            key: String::new(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            local_proxy: default_local_proxy(),
            local_port: default_local_port(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: default_monitor_interval(),
            get_timeout_secs: default_get_timeout(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            region: default_region(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `sectun.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("sectun.toml").exists() {
            let content =
                std::fs::read_to_string("sectun.toml").expect("Failed to read sectun.toml");
            toml::from_str(&content).expect("Failed to parse sectun.toml")
        } else {
            Config {
                mqtt: MqttConfig::default(),
                device: DeviceConfig::default(),
                proxy: ProxyConfig::default(),
                agent: AgentConfig::default(),
                broker: BrokerConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(endpoint) = std::env::var("SECTUN_MQTT_ENDPOINT") {
            config.mqtt.endpoint = endpoint;
        }
        if let Ok(client_id) = std::env::var("SECTUN_CLIENT_ID") {
            config.device.client_id = client_id;
        }
        if let Ok(proxy) = std::env::var("SECTUN_LOCAL_PROXY") {
            config.proxy.local_proxy = proxy;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [mqtt]
            endpoint = "broker.example.com"
            root_ca = "/certs/ca.pem"
            cert = "/certs/device.pem"
            key = "/certs/device.key"

            [device]
            client_id = "dev-42"

            [proxy]
            local_proxy = "/usr/local/bin/localproxy"

            [agent]
            monitor_interval_secs = 10

            [broker]
            url = "https://broker.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.mqtt.endpoint, "broker.example.com");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.device.client_id, "dev-42");
        assert_eq!(config.agent.monitor_interval_secs, 10);
        assert_eq!(config.agent.get_timeout_secs, 5);
        assert_eq!(config.proxy.local_port, 2299);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.agent.monitor_interval_secs, 30);
        assert_eq!(config.broker.region, "eu-west-2");
        assert_eq!(config.logging.level, "info");
    }
}
