//! RPC session adapters.
//!
//! # Sub-modules
//!
//! - **`tcp`** – [`tcp::TcpRpcConnector`]: a thin client for an RPC router
//!   speaking newline-delimited JSON over TCP.
//!
//! - **`wire`** – The JSON frames used by `tcp`.
//!
//! - **`mock`** – In-memory sessions for tests.

pub mod mock;
pub mod tcp;
pub mod wire;
