//! `VPrinter` relay mode
//!
//! Makes a real printer on another network segment reachable to slicers:
//! - Discovery relay: rebroadcasts the printer's announcements onto the
//!   slicer-side interface with the advertised address rewritten
//! - TLS relay: terminates the slicer's TLS with the emulated leaf and
//!   forwards the plaintext over a fresh TLS session to the printer

pub mod discovery;
pub mod error;
pub mod proxy;

pub use discovery::{DiscoveryRelay, relay_packet};
pub use error::RelayError;
pub use proxy::TlsRelay;
