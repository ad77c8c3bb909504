//! `DomainInfo`: the self-description broadcast by every domain.
//!
//! A heartbeat carries exactly one `DomainInfo`.  The announcer fills in
//! `rpc_address` per outgoing interface, so the same domain may be seen with
//! different addresses on hosts with several network adapters.  Only the
//! first heartbeat for a given [`DomainKey`] triggers a connection.

use std::borrow::Borrow;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::protocol::codec::ProtocolError;

/// Identity used to decide whether a discovered domain is new.
///
/// The key is the bare domain name.  Calls are addressed as
/// `<domain>/<procedure>`, so the routing table and the dedup set must agree
/// on the same identity; two realms cannot both route a domain called
/// `alpha` through one backplane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainKey(String);

impl DomainKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for DomainKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DomainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Self-description of a domain as carried in a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainInfo {
    /// Reachable IP of the advertising host (the interface the heartbeat was
    /// sent from).
    pub rpc_address: String,
    /// Port accepting inbound RPC connections.
    pub rpc_port: u16,
    /// Short identifier, unique within a realm.
    pub domain_name: String,
    /// Administrative grouping.
    pub realm_name: String,
}

impl DomainInfo {
    /// Creates a description with an empty address; the announcer fills the
    /// address in per interface.
    pub fn new(domain_name: impl Into<String>, realm_name: impl Into<String>, rpc_port: u16) -> Self {
        Self {
            rpc_address: String::new(),
            rpc_port,
            domain_name: domain_name.into(),
            realm_name: realm_name.into(),
        }
    }

    /// Returns a copy of `self` advertising `address`.
    pub fn with_address(&self, address: impl Into<String>) -> Self {
        Self {
            rpc_address: address.into(),
            ..self.clone()
        }
    }

    /// `<realm>/<domain>`.
    pub fn fully_qualified_name(&self) -> String {
        format!("{}/{}", self.realm_name, self.domain_name)
    }

    pub fn dedup_key(&self) -> DomainKey {
        DomainKey::new(self.domain_name.clone())
    }

    /// Prefix under which calls to this domain are routed (`"<domain>/"`).
    pub fn route_prefix(&self) -> String {
        format!("{}/", self.domain_name)
    }

    /// Parses `rpc_address:rpc_port` into a socket address.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidAddress`] when `rpc_address` is not an
    /// IP literal.
    pub fn rpc_socket_addr(&self) -> Result<SocketAddr, ProtocolError> {
        let ip: IpAddr = self
            .rpc_address
            .parse()
            .map_err(|_| ProtocolError::InvalidAddress(self.rpc_address.clone()))?;
        Ok(SocketAddr::new(ip, self.rpc_port))
    }

    /// Checks that the domain name can be used as a routing prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidDomain`] for an empty name or a name
    /// containing `/`.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        validate_domain_name(&self.domain_name)
    }
}

/// Checks that `name` is non-empty and contains no `/`.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidDomain`] otherwise.
pub fn validate_domain_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::InvalidDomain("domain name is empty".to_string()));
    }
    if name.contains('/') {
        return Err(ProtocolError::InvalidDomain(format!(
            "domain name '{name}' contains '/'"
        )));
    }
    Ok(())
}

impl fmt::Display for DomainInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}",
            self.fully_qualified_name(),
            self.rpc_address,
            self.rpc_port
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn alpha() -> DomainInfo {
        DomainInfo {
            rpc_address: "10.0.0.5".to_string(),
            rpc_port: 8080,
            domain_name: "alpha".to_string(),
            realm_name: "r1".to_string(),
        }
    }

    #[test]
    fn test_fully_qualified_name_joins_realm_and_domain() {
        assert_eq!(alpha().fully_qualified_name(), "r1/alpha");
    }

    #[test]
    fn test_dedup_key_is_domain_name() {
        // Arrange
        let a = alpha();
        let mut other_realm = alpha();
        other_realm.realm_name = "r2".to_string();

        // Act / Assert
        assert_eq!(a.dedup_key().as_str(), "alpha");
        assert_eq!(a.dedup_key(), other_realm.dedup_key());
    }

    #[test]
    fn test_route_prefix_ends_with_slash() {
        assert_eq!(alpha().route_prefix(), "alpha/");
    }

    #[test]
    fn test_with_address_only_replaces_address() {
        // Arrange
        let template = DomainInfo::new("alpha", "r1", 8080);

        // Act
        let info = template.with_address("192.168.1.20");

        // Assert
        assert_eq!(info.rpc_address, "192.168.1.20");
        assert_eq!(info.rpc_port, 8080);
        assert_eq!(info.domain_name, "alpha");
        assert!(template.rpc_address.is_empty());
    }

    #[test]
    fn test_rpc_socket_addr_parses_ipv4() {
        let addr = alpha().rpc_socket_addr().unwrap();
        assert_eq!(addr, "10.0.0.5:8080".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_rpc_socket_addr_rejects_hostname() {
        let mut info = alpha();
        info.rpc_address = "not-an-ip".to_string();
        assert!(matches!(
            info.rpc_socket_addr(),
            Err(ProtocolError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_and_slashed_names() {
        assert!(validate_domain_name("").is_err());
        assert!(validate_domain_name("a/b").is_err());
        assert!(validate_domain_name("alpha").is_ok());
    }

    #[test]
    fn test_display_shows_fqn_and_endpoint() {
        assert_eq!(alpha().to_string(), "r1/alpha@10.0.0.5:8080");
    }

    #[test]
    fn test_domain_key_borrows_as_str_for_map_lookup() {
        // Arrange
        let mut map = std::collections::HashMap::new();
        map.insert(DomainKey::new("alpha"), 1);

        // Act / Assert
        assert_eq!(map.get("alpha"), Some(&1));
    }
}
