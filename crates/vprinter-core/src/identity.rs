//! Device identity derivation.
//!
//! The emulated printer's serial number is derived deterministically from the
//! vendor model code: a fixed per-model prefix followed by a fixed instance
//! suffix. Slicers use the prefix to infer which product they are talking to,
//! so the table below must stay in sync with the vendor's numbering.

use crate::error::{Error, Result};

/// Fixed suffix appended to every derived serial number.
pub const SERIAL_SUFFIX: &str = "09A391800001";

/// Firmware version advertised in discovery, handshake and version pushes.
pub const FIRMWARE_VERSION: &str = "01.08.02.00";

/// A supported printer model: vendor code, serial prefix, product name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub code: &'static str,
    pub serial_prefix: &'static str,
    pub product_name: &'static str,
}

/// Model code → serial prefix table.
pub const MODELS: &[ModelInfo] = &[
    ModelInfo {
        code: "BL-P001",
        serial_prefix: "00M",
        product_name: "X1 Carbon",
    },
    ModelInfo {
        code: "BL-P002",
        serial_prefix: "00W",
        product_name: "X1",
    },
    ModelInfo {
        code: "C13",
        serial_prefix: "03W",
        product_name: "X1E",
    },
    ModelInfo {
        code: "C11",
        serial_prefix: "01S",
        product_name: "P1P",
    },
    ModelInfo {
        code: "C12",
        serial_prefix: "01P",
        product_name: "P1S",
    },
    ModelInfo {
        code: "N1",
        serial_prefix: "030",
        product_name: "A1 mini",
    },
    ModelInfo {
        code: "N2S",
        serial_prefix: "039",
        product_name: "A1",
    },
    ModelInfo {
        code: "O1D",
        serial_prefix: "094",
        product_name: "H2D",
    },
];

/// Look up a model by its vendor code (case-insensitive).
pub fn lookup_model(code: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.code.eq_ignore_ascii_case(code))
}

/// Identity the virtual printer presents on every protocol surface.
///
/// Computed from configuration, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Serial number (also the leaf certificate's common name).
    pub serial: String,
    /// Human-readable device name shown in the slicer's device list.
    pub display_name: String,
    /// Marketing product name for the model.
    pub product_name: String,
    /// Vendor model code (e.g. `C12`).
    pub model_code: String,
}

impl DeviceIdentity {
    /// Derive the identity for a model code.
    ///
    /// `display_name` overrides the default `"Virtual <product>"` name.
    pub fn derive(model_code: &str, display_name: Option<&str>) -> Result<Self> {
        let model =
            lookup_model(model_code).ok_or_else(|| Error::UnknownModel(model_code.to_string()))?;
        let display_name = display_name
            .filter(|n| !n.trim().is_empty())
            .map_or_else(|| format!("Virtual {}", model.product_name), ToString::to_string);

        Ok(Self {
            serial: format!("{}{SERIAL_SUFFIX}", model.serial_prefix),
            display_name,
            product_name: model.product_name.to_string(),
            model_code: model.code.to_string(),
        })
    }

    /// Same identity, but presenting a different serial number.
    ///
    /// Relay mode reuses the real printer's serial so broker topic
    /// subscriptions line up with what the printer publishes.
    #[must_use]
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = serial.into();
        self
    }
}
