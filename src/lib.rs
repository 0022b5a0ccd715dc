//! # Satellite Link
//!
//! Master-side protocol engine for a daisy-chained sensor/actuator bus used in
//! model-railway field control. A master polls a chain of satellites over one
//! physical link, exchanging a fixed 8-byte frame per satellite every scan
//! cycle: actuator commands on the way out, sensor and status feedback on the
//! way back.
//!
//! ## Features
//!
//! - **Wire frame codec**: bit-exact 8-byte frame layout with a 4-bit checksum
//! - **Pulse-timing PHY**: one pulse per bit, calibrated tolerance windows
//! - **Self-enumerating chain**: discovery through deliberately inverted checksums
//! - **Cyclic scan**: fixed-period loop with per-satellite error classification
//! - **Health hysteresis**: dual-threshold blocking of noisy channels
//! - **Simulated chain**: deterministic transceiver for tests and demos
//!
//! ## Quick Start
//!
//! ```rust
//! use satlink::{ActuatorMode, Channel, ChannelConfig, SimulatedChain};
//!
//! let config = ChannelConfig {
//!     max_satellites: 4,
//!     discovery_settle_ms: 0,
//!     ..ChannelConfig::default()
//! };
//! let chain = SimulatedChain::new(2);
//! let channel = Channel::new(config, chain.clone()).unwrap();
//!
//! assert_eq!(channel.discover().unwrap(), 2);
//!
//! let slot = channel.slot(0).unwrap();
//! slot.set_actuator(0, 200, ActuatorMode::High).unwrap();
//! chain.set_sensors(0, 0b1010);
//!
//! let report = channel.run_cycle().unwrap();
//! assert!(report.new_errors.is_empty());
//! assert_eq!(slot.sensors().unwrap(), 0b1010);
//! ```
//!
//! ## Architecture
//!
//! - [`frame`] and [`crc`] - wire format
//! - [`phy`] - pulse encoding and the [`Transceiver`] hardware seam
//! - [`channel`] - channel object, admin state and shared link tables
//! - [`discovery`] - chain enumeration
//! - [`scan`] - the scan cycle and CRC self-test
//! - [`health`] - error-rate hysteresis
//! - [`slot`] - per-satellite handles and observers
//! - [`simulator`] - simulated chain with fault injection

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod channel;
pub mod config;
pub mod crc;
pub mod discovery;
pub mod frame;
pub mod health;
pub mod op_state;
pub mod phy;
pub mod scan;
pub mod simulator;
pub mod slot;
pub mod stats;

// Re-export main public types for convenience
pub use channel::{Channel, ChannelError};
pub use config::{ChannelConfig, ConfigError, ErrorThresholds, MAX_SATELLITES};
pub use discovery::DiscoveryError;
pub use frame::{ActuatorMode, FrameFields, WireFrame};
pub use health::HealthTransition;
pub use op_state::{AdminState, OpState};
pub use phy::{PhyError, Pulse, PulseTiming, Transceiver};
pub use scan::{CrcSelfTest, CycleReport};
pub use simulator::{FaultInjectionConfig, SimulatedChain};
pub use slot::{SlotHandle, SlotObserver, StatusFlags};
pub use stats::{ChannelStats, ErrorCounts, ErrorKind, SlotStats};
