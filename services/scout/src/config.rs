//! Scout configuration
//!
//! Loaded in layers: struct defaults, then the YAML (or JSON) file, then
//! `SCOUT_`-prefixed environment variables with `__` as the nesting separator,
//! e.g. `SCOUT_CONTROL__SELECT_OPERATE_DELAY_MS=150`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::LoggingConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::channels::protocol::ProtocolKind;
use crate::core::iec61850::adapter::Iec61850Settings;
use crate::core::iec61850::control::{OrCat, Originator};
use crate::core::iec61850::discovery::DiscoverySettings;
use crate::core::iec61850::sbo::ControlSettings;
use crate::core::iec61850::vendor::VendorProfile;
use crate::core::modbus::adapter::PackingSettings;
use crate::error::{Result, ScoutSrvError};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SCOUT_";

/// Default IEC 61850 (MMS) port
pub const DEFAULT_MMS_PORT: u16 = 102;

/// Default Modbus TCP port
pub const DEFAULT_MODBUS_PORT: u16 = 502;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoutConfig {
    pub logging: LoggingConfig,
    pub discovery: DiscoveryConfig,
    pub control: ControlConfig,
    pub modbus: ModbusConfig,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub call_timeout_ms: u64,
    pub max_attribute_depth: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5000,
            max_attribute_depth: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlConfig {
    pub call_timeout_ms: u64,
    pub select_operate_delay_ms: u64,
    pub select_window_ms: u64,
    pub originator_id: String,
    pub originator_category: OrCat,
    pub interlock_check: bool,
    pub synchro_check: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5000,
            select_operate_delay_ms: 100,
            select_window_ms: 30_000,
            originator_id: "SCADA".to_string(),
            originator_category: OrCat::RemoteControl,
            interlock_check: false,
            synchro_check: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModbusConfig {
    pub max_block_size: u16,
    pub max_gap: u16,
    pub timeout_ms: u64,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            max_block_size: 100,
            max_gap: 10,
            timeout_ms: 3000,
        }
    }
}

/// One configured device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    /// Defaults to 102 for IEC 61850 and 502 for Modbus
    #[serde(default)]
    pub port: Option<u16>,
    pub protocol: ProtocolKind,
    #[serde(default)]
    pub vendor: VendorProfile,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Register table (Modbus only)
    #[serde(default)]
    pub registers_csv: Option<PathBuf>,
    /// Serve the device from the in-process simulator instead of the network
    #[serde(default)]
    pub simulated: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_unit_id() -> u8 {
    1
}

impl DeviceConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.protocol {
            ProtocolKind::Iec61850 => DEFAULT_MMS_PORT,
            ProtocolKind::Modbus => DEFAULT_MODBUS_PORT,
        })
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port())
    }
}

impl ScoutConfig {
    /// Load from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: ScoutConfig = common::load_layered(path, ENV_PREFIX)?;
        config.validate()?;
        debug!(devices = config.devices.len(), "Scout configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.modbus.max_block_size == 0 {
            return Err(ScoutSrvError::config("modbus.max_block_size must be at least 1"));
        }
        if self.control.call_timeout_ms == 0 || self.discovery.call_timeout_ms == 0 {
            return Err(ScoutSrvError::config("call timeouts must be non-zero"));
        }

        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(ScoutSrvError::config("device name must not be empty"));
            }
            if device.name.contains("::") {
                return Err(ScoutSrvError::config(format!(
                    "device name '{}' must not contain '::'",
                    device.name
                )));
            }
            if !seen.insert(device.name.as_str()) {
                return Err(ScoutSrvError::config(format!(
                    "device '{}' is configured twice",
                    device.name
                )));
            }
            if device.protocol == ProtocolKind::Modbus && device.registers_csv.is_none() {
                return Err(ScoutSrvError::config(format!(
                    "Modbus device '{}' needs registers_csv",
                    device.name
                )));
            }
        }
        Ok(())
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            call_timeout: Duration::from_millis(self.discovery.call_timeout_ms),
            max_attribute_depth: self.discovery.max_attribute_depth,
        }
    }

    pub fn control_settings(&self) -> ControlSettings {
        ControlSettings {
            call_timeout: Duration::from_millis(self.control.call_timeout_ms),
            select_operate_delay: Duration::from_millis(self.control.select_operate_delay_ms),
            select_window: Duration::from_millis(self.control.select_window_ms),
            originator: Originator {
                category: self.control.originator_category,
                identity: self.control.originator_id.clone(),
            },
            interlock_check: self.control.interlock_check,
            synchro_check: self.control.synchro_check,
        }
    }

    pub fn iec61850_settings(&self, device: &DeviceConfig) -> Iec61850Settings {
        Iec61850Settings {
            discovery: self.discovery_settings(),
            control: self.control_settings(),
            vendor: device.vendor,
        }
    }

    pub fn packing_settings(&self) -> PackingSettings {
        PackingSettings {
            max_block_size: self.modbus.max_block_size,
            max_gap: self.modbus.max_gap,
        }
    }

    pub fn modbus_timeout(&self) -> Duration {
        Duration::from_millis(self.modbus.timeout_ms)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ScoutConfig::load(None).unwrap();
        assert_eq!(config.discovery.call_timeout_ms, 5000);
        assert_eq!(config.discovery.max_attribute_depth, 8);
        assert_eq!(config.control.select_operate_delay_ms, 100);
        assert_eq!(config.control.select_window_ms, 30_000);
        assert_eq!(config.control.originator_id, "SCADA");
        assert_eq!(config.control.originator_category, OrCat::RemoteControl);
        assert_eq!(config.modbus.max_block_size, 100);
        assert_eq!(config.modbus.max_gap, 10);
        assert_eq!(config.modbus.timeout_ms, 3000);
        assert!(config.devices.is_empty());

        let control = config.control_settings();
        assert_eq!(control.select_operate_delay, Duration::from_millis(100));
        assert_eq!(control.originator.identity, "SCADA");
    }

    #[test]
    fn test_yaml_devices() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
control:
  select_operate_delay_ms: 250
  originator_category: station-control
devices:
  - name: Bay1
    host: 10.0.0.5
    protocol: iec61850
    vendor: ABB
  - name: PLC1
    protocol: modbus
    unit_id: 3
    registers_csv: plc1.csv
"#
        )
        .unwrap();

        let config = ScoutConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.control.select_operate_delay_ms, 250);
        assert_eq!(config.control.originator_category, OrCat::StationControl);
        assert_eq!(config.devices.len(), 2);

        let bay = config.device("Bay1").unwrap();
        assert_eq!(bay.address(), "10.0.0.5:102");
        assert_eq!(bay.vendor, VendorProfile::Abb);
        assert!(!bay.simulated);

        let plc = config.device("PLC1").unwrap();
        assert_eq!(plc.address(), "127.0.0.1:502");
        assert_eq!(plc.unit_id, 3);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ScoutConfig::default();
        config.devices.push(DeviceConfig {
            name: "PLC1".into(),
            host: default_host(),
            port: None,
            protocol: ProtocolKind::Modbus,
            vendor: VendorProfile::Auto,
            unit_id: 1,
            registers_csv: None,
            simulated: false,
        });
        assert!(matches!(config.validate(), Err(ScoutSrvError::ConfigError(_))));

        config.devices[0].registers_csv = Some("plc.csv".into());
        assert!(config.validate().is_ok());

        config.devices.push(config.devices[0].clone());
        assert!(config.validate().is_err());

        config.devices.truncate(1);
        config.devices[0].name = "A::B".into();
        assert!(config.validate().is_err());
    }
}
