//! Vendor profiles
//!
//! Field devices differ in how much headroom they need between SELECT and
//! OPERATE. The profile is guessed from the configured device name before
//! connecting unless one is set explicitly.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::sbo::ControlSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VendorProfile {
    #[default]
    #[serde(alias = "auto", alias = "AUTO")]
    Auto,
    #[serde(alias = "standard", alias = "STANDARD")]
    Standard,
    #[serde(rename = "ABB", alias = "abb")]
    Abb,
    #[serde(alias = "siemens", alias = "SIEMENS")]
    Siemens,
    #[serde(alias = "schneider", alias = "SCHNEIDER")]
    Schneider,
    #[serde(rename = "SEL", alias = "sel")]
    Sel,
    #[serde(rename = "GE", alias = "ge")]
    Ge,
    #[serde(rename = "NRElectric", alias = "nr_electric", alias = "NR")]
    NrElectric,
}

impl VendorProfile {
    /// Guess the vendor from a device name; unknown names stay `Auto`
    pub fn detect(device_name: &str) -> Self {
        let name = device_name.to_ascii_uppercase();
        if name.contains("ABB") || name.contains("RELION") {
            VendorProfile::Abb
        } else if name.contains("SIEMENS") || name.contains("SIPROTEC") {
            VendorProfile::Siemens
        } else if name.contains("SCHNEIDER") || name.contains("EASERGY") {
            VendorProfile::Schneider
        } else if name.contains("SEL") {
            VendorProfile::Sel
        } else {
            VendorProfile::Auto
        }
    }

    /// Explicit profile wins; `Auto` falls back to name detection
    pub fn resolve(self, device_name: &str) -> Self {
        match self {
            VendorProfile::Auto => Self::detect(device_name),
            explicit => explicit,
        }
    }

    /// SELECT to OPERATE delay this vendor needs, if it differs from the default
    pub fn select_operate_delay(self) -> Option<Duration> {
        match self {
            VendorProfile::Abb => Some(Duration::from_millis(150)),
            VendorProfile::Siemens => Some(Duration::from_millis(100)),
            _ => None,
        }
    }

    pub fn apply(self, settings: &mut ControlSettings) {
        if let Some(delay) = self.select_operate_delay() {
            settings.select_operate_delay = delay;
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VendorProfile::Auto => "Auto",
            VendorProfile::Standard => "Standard",
            VendorProfile::Abb => "ABB",
            VendorProfile::Siemens => "Siemens",
            VendorProfile::Schneider => "Schneider",
            VendorProfile::Sel => "SEL",
            VendorProfile::Ge => "GE",
            VendorProfile::NrElectric => "NRElectric",
        }
    }
}

impl fmt::Display for VendorProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VendorProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace(['_', '-', ' '], "").as_str() {
            "AUTO" => Ok(VendorProfile::Auto),
            "STANDARD" => Ok(VendorProfile::Standard),
            "ABB" => Ok(VendorProfile::Abb),
            "SIEMENS" => Ok(VendorProfile::Siemens),
            "SCHNEIDER" => Ok(VendorProfile::Schneider),
            "SEL" => Ok(VendorProfile::Sel),
            "GE" => Ok(VendorProfile::Ge),
            "NR" | "NRELECTRIC" => Ok(VendorProfile::NrElectric),
            other => Err(format!("unknown vendor profile '{other}'")),
        }
    }
}
