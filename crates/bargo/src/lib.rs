//! Service layer of the bargo proxy: configuration, the TCP and UDP relay
//! services, the HTTP front-end with its rule engine, and logging setup.
//!
//! The binary in `main.rs` wires these together according to the configured
//! role; the tunnel protocol itself lives in `bargo-bars`.

pub mod cli;
pub mod conf;
pub mod http;
pub mod log;
pub mod pac;
pub mod tcp;
pub mod udp;
