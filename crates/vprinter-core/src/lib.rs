//! `VPrinter` Core Library
//!
//! Shared functionality for `VPrinter` components:
//! - Virtual printer configuration, validation and restart diffing
//! - Device identity derivation (model code to serial number)
//! - Discovery packet formats shared by the responder and the relay
//! - Local network address helpers
//! - Common error types and tracing setup

pub mod config;
pub mod error;
pub mod identity;
pub mod net;
pub mod ssdp;
pub mod tracing_init;

pub use config::{EmulationMode, PortConfig, VirtualPrinterConfig};
pub use error::{Error, Result};
pub use identity::DeviceIdentity;
