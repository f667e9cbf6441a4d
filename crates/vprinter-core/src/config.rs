//! Virtual printer configuration.
//!
//! The record is owned by an external configuration API; this crate only
//! validates it and decides whether a change requires restarting the
//! running services. On disk it is stored as JSON:
//!
//! ```json
//! {
//!   "enabled": true,
//!   "mode": "server-immediate",
//!   "device_model": "C12",
//!   "access_code": "12345678"
//! }
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::lookup_model;

/// Required length of the shared access code in server modes.
pub const ACCESS_CODE_LEN: usize = 8;

/// How the virtual printer behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmulationMode {
    /// Emulate a printer; archive every upload immediately.
    #[default]
    ServerImmediate,
    /// Emulate a printer; hold uploads for operator review.
    ServerReview,
    /// Emulate a printer; archive uploads and enqueue them unassigned.
    ServerQueue,
    /// Terminate TLS and forward to a real printer on another network.
    Relay,
}

impl EmulationMode {
    /// Whether this mode runs the local protocol servers.
    pub const fn is_server(self) -> bool {
        !matches!(self, Self::Relay)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServerImmediate => "server-immediate",
            Self::ServerReview => "server-review",
            Self::ServerQueue => "server-queue",
            Self::Relay => "relay",
        }
    }
}

impl std::fmt::Display for EmulationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listening ports. Defaults are the ports real devices use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub discovery: u16,
    /// Bind/detect handshake ports (different slicer versions probe different ones).
    pub handshake: Vec<u16>,
    pub file_transfer: u16,
    pub broker: u16,
    /// Inclusive range of passive data ports.
    pub passive_start: u16,
    pub passive_end: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            discovery: 2021,
            handshake: vec![3000, 3002],
            file_transfer: 990,
            broker: 8883,
            passive_start: 50000,
            passive_end: 50100,
        }
    }
}

/// Complete virtual printer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualPrinterConfig {
    pub enabled: bool,
    pub mode: EmulationMode,
    /// Vendor model code; selects serial prefix and product name.
    pub device_model: String,
    /// 8-character shared secret. Unused in relay mode.
    pub access_code: String,
    /// Real printer address (relay mode).
    pub target_host: Option<String>,
    /// Real printer serial (relay mode). Falls back to the derived serial.
    pub target_serial: Option<String>,
    pub bind_address: IpAddr,
    /// Address the device must also appear reachable on (second network).
    pub secondary_advertise_address: Option<IpAddr>,
    pub display_name: Option<String>,
    pub ports: PortConfig,
}

impl Default for VirtualPrinterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: EmulationMode::default(),
            device_model: "BL-P001".to_string(),
            access_code: String::new(),
            target_host: None,
            target_serial: None,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            secondary_advertise_address: None,
            display_name: None,
            ports: PortConfig::default(),
        }
    }
}

impl VirtualPrinterConfig {
    /// Check the invariants for the selected mode.
    ///
    /// Disabled configurations are only checked for field shape, so an
    /// operator can save a half-filled record before enabling it.
    pub fn validate(&self) -> Result<()> {
        if lookup_model(&self.device_model).is_none() {
            return Err(Error::Config(format!(
                "unknown device model '{}'",
                self.device_model
            )));
        }

        if self.mode.is_server() {
            let len = self.access_code.chars().count();
            if len != 0 && len != ACCESS_CODE_LEN {
                return Err(Error::Config(format!(
                    "access code must be exactly {ACCESS_CODE_LEN} characters, got {len}"
                )));
            }
            if self.enabled && len == 0 {
                return Err(Error::Config(format!(
                    "access code is required in {} mode",
                    self.mode
                )));
            }
        } else if self.enabled && self.target_host().is_none() {
            return Err(Error::Config(
                "target host is required in relay mode".to_string(),
            ));
        }

        if self.ports.passive_start > self.ports.passive_end {
            return Err(Error::Config(format!(
                "passive port range {}-{} is empty",
                self.ports.passive_start, self.ports.passive_end
            )));
        }

        Ok(())
    }

    /// Trimmed relay target, `None` when unset or blank.
    pub fn target_host(&self) -> Option<&str> {
        self.target_host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
    }

    /// Trimmed relay target serial, `None` when unset or blank.
    pub fn target_serial(&self) -> Option<&str> {
        self.target_serial
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Whether moving from `old` to `new` requires tearing down running services.
///
/// Access-code changes are applied live and never force a restart.
pub fn requires_restart(old: &VirtualPrinterConfig, new: &VirtualPrinterConfig) -> bool {
    if old.mode != new.mode
        || !old.device_model.eq_ignore_ascii_case(&new.device_model)
        || old.bind_address != new.bind_address
        || old.ports != new.ports
        || old.display_name != new.display_name
        || old.secondary_advertise_address != new.secondary_advertise_address
    {
        return true;
    }

    new.mode == EmulationMode::Relay
        && (old.target_host() != new.target_host() || old.target_serial() != new.target_serial())
}

/// Load a configuration record from a JSON file.
pub fn load_config_file(path: &Path) -> Result<VirtualPrinterConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}
