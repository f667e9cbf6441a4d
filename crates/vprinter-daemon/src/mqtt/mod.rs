//! Minimal message broker for the emulated device.
//!
//! The packet codec is written by hand: only one device, two topics and a
//! handful of control packets are ever exchanged.

pub mod broker;
pub mod codec;
pub mod request;
pub mod status;

pub use broker::{BROKER_USER, BrokerContext, BrokerError, MqttBroker, PUSH_INTERVAL};
pub use codec::{CodecError, Packet, decode, encode};
pub use status::{GcodeState, JobState, JobTracker, report_topic};
