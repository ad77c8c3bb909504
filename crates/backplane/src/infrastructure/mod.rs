//! Infrastructure layer of the backplane.
//!
//! Contains OS-facing adapters: multicast sockets and interface enumeration,
//! the TCP RPC client, and file-system configuration.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `backplane_core`, but MUST NOT be imported by the `application` layer
//! outside of tests.

pub mod network;
pub mod rpc;
pub mod storage;
