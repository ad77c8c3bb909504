//! # backplane-core
//!
//! Shared library for the domain backplane containing the self-description a
//! domain broadcasts (`DomainInfo`), the identity used to deduplicate
//! discovered domains (`DomainKey`), and the heartbeat wire codec.
//!
//! This crate has zero dependencies on sockets, timers, or the RPC layer, so
//! everything in it can be tested with plain `#[test]` functions.
//!
//! # Architecture overview
//!
//! A *domain* is an independently started process exposing remote
//! procedures.  Every domain periodically multicasts a heartbeat describing
//! where its RPC endpoint can be reached.  Other domains listen for those
//! heartbeats, connect to each newly discovered domain, and route calls
//! addressed to `<domain>/<procedure>` over that connection.
//!
//! - **`domain`** – `DomainInfo` and `DomainKey`.
//! - **`protocol`** – How a `DomainInfo` travels over the wire:
//!   `[version:1][payload:N]`, where the payload is a JSON array.

pub mod domain;
pub mod protocol;

pub use domain::domain_info::{DomainInfo, DomainKey};
pub use protocol::codec::{decode_heartbeat, encode_heartbeat, ProtocolError};
pub use protocol::{MAX_HEARTBEAT_SIZE, PROTOCOL_VERSION};
