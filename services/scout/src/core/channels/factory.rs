//! Device construction from configuration

use std::sync::Arc;

use tracing::info;

use super::protocol::{DeviceProtocol, ProtocolKind};
use crate::config::{DeviceConfig, ScoutConfig};
use crate::core::iec61850::adapter::Iec61850Device;
use crate::core::iec61850::simulator::SimulatedIed;
use crate::core::modbus::adapter::ModbusDevice;
use crate::core::modbus::csv_import::load_registers;
use crate::core::modbus::transport::{ModbusTransport, SimulatedModbus, TcpModbusTransport};
use crate::error::{Result, ScoutSrvError};

/// Build a device from its configuration entry
///
/// IEC 61850 devices need an MMS client library behind [`MmsClient`]; the
/// only one linked into this binary is the simulator, so a non-simulated
/// IEC 61850 device is a configuration error.
///
/// [`MmsClient`]: crate::core::iec61850::client::MmsClient
pub fn create_device(device: &DeviceConfig, config: &ScoutConfig) -> Result<DeviceProtocol> {
    match device.protocol {
        ProtocolKind::Iec61850 => {
            if !device.simulated {
                return Err(ScoutSrvError::config(format!(
                    "IEC 61850 device '{}' at {}: no MMS client is linked, set simulated: true",
                    device.name,
                    device.address()
                )));
            }
            let ied = SimulatedIed::new(device.name.clone()).with_demo_model();
            info!(device = %device.name, "IEC 61850 device created (simulated)");
            Ok(Iec61850Device::new(
                device.name.clone(),
                Arc::new(ied),
                config.iec61850_settings(device),
            )
            .into())
        },
        ProtocolKind::Modbus => {
            let csv = device.registers_csv.as_deref().ok_or_else(|| {
                ScoutSrvError::config(format!("Modbus device '{}' needs registers_csv", device.name))
            })?;
            let registers = load_registers(csv, device.unit_id)?;
            let transport: Box<dyn ModbusTransport> = if device.simulated {
                Box::new(SimulatedModbus::new())
            } else {
                Box::new(TcpModbusTransport::new(device.address(), config.modbus_timeout()))
            };
            info!(
                device = %device.name,
                address = %device.address(),
                simulated = device.simulated,
                "Modbus device created"
            );
            Ok(ModbusDevice::new(
                device.name.clone(),
                transport,
                registers,
                config.packing_settings(),
            )?
            .into())
        },
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::iec61850::vendor::VendorProfile;

    fn device(protocol: ProtocolKind, simulated: bool) -> DeviceConfig {
        DeviceConfig {
            name: "Dev1".into(),
            host: "127.0.0.1".into(),
            port: None,
            protocol,
            vendor: VendorProfile::Auto,
            unit_id: 1,
            registers_csv: None,
            simulated,
        }
    }

    #[test]
    fn test_iec_requires_simulator() {
        let config = ScoutConfig::default();
        let err = create_device(&device(ProtocolKind::Iec61850, false), &config).unwrap_err();
        assert!(matches!(err, ScoutSrvError::ConfigError(_)));

        let built = create_device(&device(ProtocolKind::Iec61850, true), &config).unwrap();
        assert_eq!(built.kind(), ProtocolKind::Iec61850);
    }

    #[test]
    fn test_modbus_from_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regs.csv");
        std::fs::write(
            &path,
            "Index,PointType,Name,DataType\n0,4,Voltage,uint16\n1,4,Current,uint16\n",
        )
        .unwrap();

        let mut cfg = device(ProtocolKind::Modbus, true);
        cfg.registers_csv = Some(path);
        let built = create_device(&cfg, &ScoutConfig::default()).unwrap();
        match built {
            DeviceProtocol::Modbus(d) => assert_eq!(d.blocks().len(), 1),
            other => panic!("unexpected device {other:?}"),
        }

        let missing = device(ProtocolKind::Modbus, true);
        assert!(create_device(&missing, &ScoutConfig::default()).is_err());
    }
}
