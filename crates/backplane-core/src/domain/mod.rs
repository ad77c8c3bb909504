//! Domain layer: pure types describing a domain, with no I/O.
//!
//! - `domain_info` – the self-description a domain advertises and the key
//!   used to decide whether a discovered domain is new.

pub mod domain_info;
