//! # Simulation Harness
//!
//! Runs protocol engines without hardware. [`SimHost`] is a complete
//! in-memory controller; [`SimNetwork`] wires several engines together over
//! a lossy mesh with emulated radio modules, a coordinator that answers
//! loopback probes, and battery-powered sensor concentrators ([`SimHub`]).
//!
//! The `simulate` subcommand and the integration tests are built on this.

pub mod host;
pub mod network;

pub use host::{HostEvent, SimHost, DEMO_REVERSE};
pub use network::{NetworkStats, SimHub, SimModule, SimNetwork, SimNode, COORDINATOR};
