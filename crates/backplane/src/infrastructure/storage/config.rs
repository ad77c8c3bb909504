//! TOML configuration for the backplane.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working single-host setup:
//!
//! ```toml
//! log_level = "info"
//!
//! [domain]
//! name = "default"
//! realm = "default"
//!
//! [rpc]
//! router_address = "127.0.0.1:8000"
//! # advertise_port = 8000   # defaults to the router port
//!
//! [discovery]
//! multicast_group = "239.0.0.1"
//! multicast_port = 10984
//! heartbeat_period_ms = 2000
//! interface_poll_period_ms = 2000
//! receive_buffer_size = 512
//!
//! [routing]
//! max_in_flight_calls = 64
//! ```
//!
//! Fields annotated with `#[serde(default = "some_fn")]` take the value of
//! `some_fn()` when absent, so older files keep working when fields are added.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use backplane_core::domain::domain_info::validate_domain_name;
use backplane_core::MAX_HEARTBEAT_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is syntactically fine but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Default `tracing` filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub domain: DomainSection,
    #[serde(default)]
    pub rpc: RpcSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub routing: RoutingSection,
}

/// Identity this process announces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainSection {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_name")]
    pub realm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcSection {
    /// Local RPC router the backplane attaches to.
    #[serde(default = "default_router_address")]
    pub router_address: String,
    /// Port announced to other domains; the router port when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySection {
    #[serde(default = "default_multicast_group")]
    pub multicast_group: String,
    #[serde(default = "default_multicast_port")]
    pub multicast_port: u16,
    #[serde(default = "default_period_ms")]
    pub heartbeat_period_ms: u64,
    #[serde(default = "default_period_ms")]
    pub interface_poll_period_ms: u64,
    /// At least 512.  Heartbeats are never longer than 512 bytes, so a
    /// larger buffer is accepted but does not admit longer datagrams.
    #[serde(default = "default_receive_buffer_size")]
    pub receive_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingSection {
    #[serde(default = "default_max_in_flight_calls")]
    pub max_in_flight_calls: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_name() -> String {
    "default".to_string()
}
fn default_router_address() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_multicast_group() -> String {
    "239.0.0.1".to_string()
}
fn default_multicast_port() -> u16 {
    10984
}
fn default_period_ms() -> u64 {
    2000
}
fn default_receive_buffer_size() -> usize {
    MAX_HEARTBEAT_SIZE
}
fn default_max_in_flight_calls() -> usize {
    64
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            domain: DomainSection::default(),
            rpc: RpcSection::default(),
            discovery: DiscoverySection::default(),
            routing: RoutingSection::default(),
        }
    }
}

impl Default for DomainSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            realm: default_name(),
        }
    }
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            router_address: default_router_address(),
            advertise_port: None,
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            multicast_group: default_multicast_group(),
            multicast_port: default_multicast_port(),
            heartbeat_period_ms: default_period_ms(),
            interface_poll_period_ms: default_period_ms(),
            receive_buffer_size: default_receive_buffer_size(),
        }
    }
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            max_in_flight_calls: default_max_in_flight_calls(),
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl AppConfig {
    /// Checks every value the runtime relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_domain_name(&self.domain.name)
            .map_err(|e| ConfigError::Invalid(format!("domain.name: {e}")))?;
        if self.domain.realm.is_empty() {
            return Err(ConfigError::Invalid("domain.realm is empty".to_string()));
        }
        self.router_addr()?;
        self.multicast_group()?;
        if self.discovery.heartbeat_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "discovery.heartbeat_period_ms must be positive".to_string(),
            ));
        }
        if self.discovery.interface_poll_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "discovery.interface_poll_period_ms must be positive".to_string(),
            ));
        }
        if self.discovery.receive_buffer_size < MAX_HEARTBEAT_SIZE {
            return Err(ConfigError::Invalid(format!(
                "discovery.receive_buffer_size must be at least {MAX_HEARTBEAT_SIZE}"
            )));
        }
        if self.routing.max_in_flight_calls == 0 {
            return Err(ConfigError::Invalid(
                "routing.max_in_flight_calls must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn router_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.rpc.router_address.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "rpc.router_address '{}' is not an ip:port pair",
                self.rpc.router_address
            ))
        })
    }

    /// Port other domains should connect to.
    pub fn advertise_port(&self) -> Result<u16, ConfigError> {
        match self.rpc.advertise_port {
            Some(port) => Ok(port),
            None => Ok(self.router_addr()?.port()),
        }
    }

    pub fn multicast_group(&self) -> Result<SocketAddrV4, ConfigError> {
        let ip: Ipv4Addr = self.discovery.multicast_group.parse().map_err(|_| {
            ConfigError::Invalid(format!(
                "discovery.multicast_group '{}' is not an IPv4 address",
                self.discovery.multicast_group
            ))
        })?;
        if !ip.is_multicast() {
            return Err(ConfigError::Invalid(format!(
                "discovery.multicast_group {ip} is not a multicast address"
            )));
        }
        Ok(SocketAddrV4::new(ip, self.discovery.multicast_port))
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.discovery.heartbeat_period_ms)
    }

    pub fn interface_poll_period(&self) -> Duration {
        Duration::from_millis(self.discovery.interface_poll_period_ms)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Parses configuration from TOML text.
pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Reads the config file at `path`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read (a missing file is
/// an error: the path was asked for explicitly) and [`ConfigError::Parse`]
/// for invalid TOML.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Renders `config` as TOML.
pub fn render_config(config: &AppConfig) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(config)?)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Defaults ──────────────────────────────────────────────────────────────

    #[test]
    fn test_default_config_matches_documented_values() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.domain.name, "default");
        assert_eq!(cfg.domain.realm, "default");
        assert_eq!(cfg.rpc.router_address, "127.0.0.1:8000");
        assert_eq!(cfg.discovery.multicast_group, "239.0.0.1");
        assert_eq!(cfg.discovery.multicast_port, 10984);
        assert_eq!(cfg.heartbeat_period(), Duration::from_millis(2000));
        assert_eq!(cfg.interface_poll_period(), Duration::from_millis(2000));
        assert_eq!(cfg.discovery.receive_buffer_size, 512);
        assert_eq!(cfg.routing.max_in_flight_calls, 64);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_advertise_port_defaults_to_router_port() {
        let mut cfg = AppConfig::default();
        assert_eq!(cfg.advertise_port().unwrap(), 8000);

        cfg.rpc.advertise_port = Some(9100);
        assert_eq!(cfg.advertise_port().unwrap(), 9100);
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        assert_eq!(parse_config("").unwrap(), AppConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        // Arrange
        let toml = r#"
            [domain]
            name = "alpha"

            [discovery]
            multicast_port = 20000
        "#;

        // Act
        let cfg = parse_config(toml).unwrap();

        // Assert
        assert_eq!(cfg.domain.name, "alpha");
        assert_eq!(cfg.domain.realm, "default");
        assert_eq!(cfg.discovery.multicast_port, 20000);
        assert_eq!(cfg.discovery.multicast_group, "239.0.0.1");
    }

    // ── TOML round-trip ───────────────────────────────────────────────────────

    #[test]
    fn test_config_renders_and_parses_round_trip() {
        // Arrange
        let mut cfg = AppConfig::default();
        cfg.domain.name = "alpha".to_string();
        cfg.domain.realm = "r1".to_string();
        cfg.rpc.advertise_port = Some(9100);
        cfg.routing.max_in_flight_calls = 8;

        // Act
        let text = render_config(&cfg).unwrap();
        let parsed = parse_config(&text).unwrap();

        // Assert
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        assert!(matches!(parse_config("[domain"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_load_config_missing_file_is_io_error() {
        let result = load_config(Path::new("/nonexistent/backplane/config.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    // ── Validation ────────────────────────────────────────────────────────────

    fn invalid(edit: impl FnOnce(&mut AppConfig)) -> String {
        let mut cfg = AppConfig::default();
        edit(&mut cfg);
        match cfg.validate() {
            Err(ConfigError::Invalid(reason)) => reason,
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_unroutable_domain_names() {
        assert!(invalid(|c| c.domain.name = String::new()).contains("domain.name"));
        assert!(invalid(|c| c.domain.name = "a/b".to_string()).contains("domain.name"));
    }

    #[test]
    fn test_validate_rejects_non_multicast_group() {
        assert!(invalid(|c| c.discovery.multicast_group = "10.0.0.1".to_string())
            .contains("not a multicast address"));
        assert!(invalid(|c| c.discovery.multicast_group = "bogus".to_string())
            .contains("not an IPv4 address"));
    }

    #[test]
    fn test_validate_rejects_zero_periods_and_limits() {
        assert!(invalid(|c| c.discovery.heartbeat_period_ms = 0).contains("heartbeat_period_ms"));
        assert!(invalid(|c| c.discovery.interface_poll_period_ms = 0)
            .contains("interface_poll_period_ms"));
        assert!(invalid(|c| c.routing.max_in_flight_calls = 0).contains("max_in_flight_calls"));
    }

    #[test]
    fn test_validate_rejects_small_receive_buffer() {
        assert!(invalid(|c| c.discovery.receive_buffer_size = 100).contains("receive_buffer_size"));
    }

    #[test]
    fn test_validate_accepts_receive_buffer_above_heartbeat_maximum() {
        let mut cfg = AppConfig::default();
        cfg.discovery.receive_buffer_size = 4096;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unparsable_router_address() {
        assert!(invalid(|c| c.rpc.router_address = "localhost".to_string())
            .contains("rpc.router_address"));
    }
}
