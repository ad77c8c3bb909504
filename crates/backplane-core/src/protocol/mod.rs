//! Protocol module containing the heartbeat wire codec.
//!
//! Wire format of one UDP heartbeat datagram:
//! ```text
//! [version:1]["<rpc_address>",<rpc_port>,"<domain_name>","<realm_name>"]
//! ```
//! The payload after the version byte is a JSON array holding the four
//! `DomainInfo` fields in that order.

pub mod codec;

pub use codec::{decode_heartbeat, encode_heartbeat, ProtocolError};

/// Heartbeat protocol version.  Datagrams carrying any other leading byte
/// are discarded without looking at the payload.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest heartbeat datagram accepted or produced, in bytes.
pub const MAX_HEARTBEAT_SIZE: usize = 512;
