//! Encoding and decoding of heartbeat datagrams.
//!
//! The version byte is checked before anything else so that a future
//! protocol revision can change the payload layout freely: an old listener
//! never tries to interpret a payload it does not understand.

use thiserror::Error;

use super::{MAX_HEARTBEAT_SIZE, PROTOCOL_VERSION};
use crate::domain::domain_info::DomainInfo;

/// Errors that can occur during heartbeat encoding or decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The datagram is shorter than the minimum required length.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The leading version byte is not [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The payload could not be parsed as a `DomainInfo`.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The datagram exceeds [`MAX_HEARTBEAT_SIZE`].
    #[error("heartbeat of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },

    /// The advertised domain name cannot be used as a routing prefix.
    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    /// The advertised RPC address is not an IP literal.
    #[error("invalid rpc address: {0}")]
    InvalidAddress(String),
}

/// Wire representation: the four fields as an ordered JSON array.
type WireDomainInfo = (String, u16, String, String);

/// Encodes `info` into a heartbeat datagram.
///
/// # Errors
///
/// Returns [`ProtocolError::Oversized`] if the encoded datagram would not fit
/// in [`MAX_HEARTBEAT_SIZE`] bytes.
///
/// # Examples
///
/// ```rust
/// use backplane_core::{decode_heartbeat, encode_heartbeat, DomainInfo};
///
/// let info = DomainInfo::new("alpha", "r1", 8080).with_address("10.0.0.5");
/// let bytes = encode_heartbeat(&info).unwrap();
/// assert_eq!(bytes[0], backplane_core::PROTOCOL_VERSION);
/// assert_eq!(decode_heartbeat(&bytes).unwrap(), info);
/// ```
pub fn encode_heartbeat(info: &DomainInfo) -> Result<Vec<u8>, ProtocolError> {
    let wire: (&str, u16, &str, &str) = (
        &info.rpc_address,
        info.rpc_port,
        &info.domain_name,
        &info.realm_name,
    );

    let mut buf = Vec::with_capacity(64);
    buf.push(PROTOCOL_VERSION);
    serde_json::to_writer(&mut buf, &wire)
        .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;

    if buf.len() > MAX_HEARTBEAT_SIZE {
        return Err(ProtocolError::Oversized {
            size: buf.len(),
            max: MAX_HEARTBEAT_SIZE,
        });
    }
    Ok(buf)
}

/// Decodes one heartbeat datagram.
///
/// # Errors
///
/// - [`ProtocolError::InsufficientData`] for an empty datagram.
/// - [`ProtocolError::Oversized`] above [`MAX_HEARTBEAT_SIZE`].
/// - [`ProtocolError::UnsupportedVersion`] when the version byte differs; the
///   payload is not inspected in that case.
/// - [`ProtocolError::MalformedPayload`], [`ProtocolError::InvalidDomain`] or
///   [`ProtocolError::InvalidAddress`] for a payload that does not describe a
///   routable domain.
pub fn decode_heartbeat(bytes: &[u8]) -> Result<DomainInfo, ProtocolError> {
    let (&version, payload) = bytes.split_first().ok_or(ProtocolError::InsufficientData {
        needed: 1,
        available: 0,
    })?;

    if bytes.len() > MAX_HEARTBEAT_SIZE {
        return Err(ProtocolError::Oversized {
            size: bytes.len(),
            max: MAX_HEARTBEAT_SIZE,
        });
    }

    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    let (rpc_address, rpc_port, domain_name, realm_name): WireDomainInfo =
        serde_json::from_slice(payload).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;

    let info = DomainInfo {
        rpc_address,
        rpc_port,
        domain_name,
        realm_name,
    };
    info.validate()?;
    info.rpc_socket_addr()?;
    Ok(info)
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

    fn datagram(version: u8, payload: &str) -> Vec<u8> {
        let mut buf = vec![version];
        buf.extend_from_slice(payload.as_bytes());
        buf
    }

    #[test]
    fn test_encode_heartbeat_layout_is_version_then_json_array() {
        // Arrange / Act
        let bytes = encode_heartbeat(&alpha()).unwrap();

        // Assert
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(&bytes[1..], br#"["10.0.0.5",8080,"alpha","r1"]"#);
    }

    #[test]
    fn test_decode_heartbeat_round_trips_spec_example() {
        // Arrange
        let original = alpha();

        // Act
        let decoded = decode_heartbeat(&encode_heartbeat(&original).unwrap()).unwrap();

        // Assert
        assert_eq!(decoded, original);
        assert_eq!(decoded.fully_qualified_name(), "r1/alpha");
    }

    #[test]
    fn test_decode_heartbeat_rejects_empty_datagram() {
        assert_eq!(
            decode_heartbeat(&[]),
            Err(ProtocolError::InsufficientData {
                needed: 1,
                available: 0
            })
        );
    }

    #[test]
    fn test_decode_heartbeat_rejects_wrong_version_before_payload() {
        // Arrange: a payload that would otherwise be valid
        let bytes = datagram(2, r#"["10.0.0.5",8080,"alpha","r1"]"#);

        // Act / Assert
        assert_eq!(decode_heartbeat(&bytes), Err(ProtocolError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_decode_heartbeat_wrong_version_with_garbage_payload_reports_version() {
        // The payload is never parsed, so the version error wins.
        let bytes = datagram(0x7F, "\u{1}garbage");
        assert_eq!(decode_heartbeat(&bytes), Err(ProtocolError::UnsupportedVersion(0x7F)));
    }

    #[test]
    fn test_decode_heartbeat_rejects_missing_payload() {
        let bytes = vec![PROTOCOL_VERSION];
        assert!(matches!(
            decode_heartbeat(&bytes),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_decode_heartbeat_rejects_wrong_field_count() {
        let bytes = datagram(PROTOCOL_VERSION, r#"["10.0.0.5",8080,"alpha"]"#);
        assert!(matches!(
            decode_heartbeat(&bytes),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_decode_heartbeat_rejects_port_out_of_range() {
        let bytes = datagram(PROTOCOL_VERSION, r#"["10.0.0.5",70000,"alpha","r1"]"#);
        assert!(matches!(
            decode_heartbeat(&bytes),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_decode_heartbeat_rejects_trailing_bytes() {
        let bytes = datagram(PROTOCOL_VERSION, r#"["10.0.0.5",8080,"alpha","r1"]xx"#);
        assert!(matches!(
            decode_heartbeat(&bytes),
            Err(ProtocolError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_decode_heartbeat_rejects_unroutable_domain_name() {
        let bytes = datagram(PROTOCOL_VERSION, r#"["10.0.0.5",8080,"al/pha","r1"]"#);
        assert!(matches!(
            decode_heartbeat(&bytes),
            Err(ProtocolError::InvalidDomain(_))
        ));
    }

    #[test]
    fn test_decode_heartbeat_rejects_non_ip_address() {
        let bytes = datagram(PROTOCOL_VERSION, r#"["host.local",8080,"alpha","r1"]"#);
        assert!(matches!(
            decode_heartbeat(&bytes),
            Err(ProtocolError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_decode_heartbeat_rejects_oversized_datagram() {
        // Arrange
        let bytes = vec![PROTOCOL_VERSION; MAX_HEARTBEAT_SIZE + 1];

        // Act / Assert
        assert_eq!(
            decode_heartbeat(&bytes),
            Err(ProtocolError::Oversized {
                size: MAX_HEARTBEAT_SIZE + 1,
                max: MAX_HEARTBEAT_SIZE
            })
        );
    }

    #[test]
    fn test_encode_heartbeat_refuses_oversized_description() {
        // Arrange
        let mut info = alpha();
        info.realm_name = "r".repeat(MAX_HEARTBEAT_SIZE);

        // Act / Assert
        assert!(matches!(
            encode_heartbeat(&info),
            Err(ProtocolError::Oversized { .. })
        ));
    }

    #[test]
    fn test_encode_heartbeat_escapes_quotes_in_names() {
        // Arrange
        let mut info = alpha();
        info.realm_name = "r\"1".to_string();

        // Act
        let decoded = decode_heartbeat(&encode_heartbeat(&info).unwrap()).unwrap();

        // Assert
        assert_eq!(decoded.realm_name, "r\"1");
    }
}
