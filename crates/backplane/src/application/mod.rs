//! Application layer of the backplane.
//!
//! Everything here works against traits: the RPC session interface in
//! [`rpc`] and the [`session_registry::DiscoveryCache`] feedback hook.  No
//! sockets, no files.
//!
//! # Sub-modules
//!
//! - **`rpc`** – The narrow RPC session interface the backplane consumes
//!   (connect, call, provide, unprovide, disconnect notification).
//!
//! - **`session_registry`** – The actor that owns the domain → session table,
//!   turns discovery events into outbound connections and removes sessions
//!   when they are lost.
//!
//! - **`route_call`** – Parses `<domain>/<procedure>` targets and forwards a
//!   proxied invocation to the owning session.

pub mod route_call;
pub mod rpc;
pub mod session_registry;
