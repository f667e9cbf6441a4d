//! `VPrinter` Daemon Library
//!
//! Emulates a network 3D printer for slicers on the local network:
//! - Discovery responder and bind/detect handshake responder
//! - Implicit-TLS file-transfer server with passive data channels
//! - Minimal message broker publishing device status
//! - Lifecycle manager switching between server and relay modes
//! - Collaborator traits for archiving jobs and observing print commands

pub mod archive;
pub mod discovery;
pub mod events;
pub mod ftp;
pub mod handshake;
pub mod manager;
pub mod mqtt;
