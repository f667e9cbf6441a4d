//! `VPrinter` certificate authority and TLS configuration
//!
//! Slicers validate the TLS identity of the printer they dial, so the virtual
//! printer presents a leaf certificate whose common name is its serial number,
//! signed by a long-lived local authority.
//!
//! ## Trust material
//!
//! - **Authority**: self-signed, 20 years, shared by every virtual printer
//!   instance on the machine; regenerated within 30 days of expiry
//! - **Leaf**: 10 years, bound to one serial number and its reachable
//!   addresses; cached until explicitly invalidated
//! - **Outbound**: relay mode talks to real printers with verification
//!   disabled, through a separate client configuration

pub mod certs;
pub mod error;
pub mod tls;

pub use certs::{CertPaths, CertificateAuthority, LeafMetadata, invalidate_authority_cache};
pub use error::CertError;
pub use tls::{insecure_client_config, install_crypto_provider, server_config};
