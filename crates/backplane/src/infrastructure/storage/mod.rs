//! File-system storage: the TOML configuration.

pub mod config;
