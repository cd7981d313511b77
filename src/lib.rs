//! # woisradio - Radio Protocol Engine for Multi-Unit Irrigation Controllers
//!
//! woisradio implements the radio side of an irrigation controller: a master
//! controller, up to three expansion controllers and up to twelve
//! battery-powered wireless sensor concentrators exchange small, CRC-protected
//! messages over a low-power mesh radio module.
//!
//! ## Features
//!
//! - **Message codec**: versioned header, CRC-16 over the body, typed messages.
//! - **Reliable exchanges**: command/ack with msgId echo, AT command retry queue.
//! - **Segmented transfer**: configuration, firmware and history images in 64-byte segments.
//! - **Expansion bus**: liveness tracking, command fan-out and the irrigation baton.
//! - **Sensor concentrators**: association, status exchange, sleep scheduling and relay override.
//! - **Link supervision**: module initialisation and a loopback self-test state machine.
//! - **Simulator**: in-memory hosts and a lossy mesh for exercising all of the above.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use woisradio::config::Config;
//! use woisradio::radio::RadioEngine;
//! use woisradio::sim::SimHost;
//! use woisradio::transport::MemoryTransport;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let host = SimHost::new(usize::from(config.unit.zones_per_unit));
//!     let mut engine = RadioEngine::from_config(MemoryTransport::new(true), host, &config);
//!     loop {
//!         engine.poll();
//!         # break;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`protocol`] - header constants, CRC, message structs and opcodes
//! - [`transport`] - frame transport seam and the in-memory implementation
//! - [`host`] - collaborator traits the controller implements
//! - [`radio`] - the protocol engine
//! - [`sim`] - simulated controller, radio modules and mesh
//! - [`config`] - configuration management and validation
//! - [`logutil`] / [`metrics`] - logging helpers and protocol counters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Host (traits) │ ← irrigation, config image, sensors, storage
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │   RadioEngine   │ ← protocol state, driven by poll()
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ FrameTransport  │ ← radio module API frames
//! └─────────────────┘
//! ```

pub mod config;
pub mod host;
pub mod logutil;
pub mod metrics;
pub mod protocol;
pub mod radio;
pub mod sim;
pub mod transport;
