//! Protocol dispatch
//!
//! A device is one of a closed set of protocol variants. Each variant
//! implements the same five operations on its own; this enum only routes.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::core::iec61850::adapter::Iec61850Device;
use crate::core::iec61850::control::{CommandOptions, ControlPath};
use crate::core::iec61850::discovery::DiscoveryReport;
use crate::core::iec61850::reference::strip_device_prefix;
use crate::core::iec61850::sbo::CommandOutcome;
use crate::core::modbus::adapter::{ModbusDevice, WriteOutcome};
use crate::core::model::node::Node;
use crate::core::model::signal::{Signal, SignalValue};
use crate::core::model::update::UpdateSlot;
use crate::error::{Result, ScoutSrvError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Iec61850,
    Modbus,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Iec61850 => f.write_str("iec61850"),
            ProtocolKind::Modbus => f.write_str("modbus"),
        }
    }
}

/// Outcome of `send_command`, by protocol
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandReport {
    Control(CommandOutcome),
    Write(WriteOutcome),
}

#[derive(Debug)]
pub enum DeviceProtocol {
    Iec61850(Iec61850Device),
    Modbus(ModbusDevice),
}

impl DeviceProtocol {
    pub fn name(&self) -> &str {
        match self {
            DeviceProtocol::Iec61850(d) => d.name(),
            DeviceProtocol::Modbus(d) => d.name(),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            DeviceProtocol::Iec61850(_) => ProtocolKind::Iec61850,
            DeviceProtocol::Modbus(_) => ProtocolKind::Modbus,
        }
    }

    pub fn updates(&self) -> &UpdateSlot {
        match self {
            DeviceProtocol::Iec61850(d) => d.updates(),
            DeviceProtocol::Modbus(d) => d.updates(),
        }
    }

    pub fn tree_handle(&self) -> Arc<RwLock<Arc<Node>>> {
        match self {
            DeviceProtocol::Iec61850(d) => d.tree_handle(),
            DeviceProtocol::Modbus(d) => d.tree_handle(),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            DeviceProtocol::Iec61850(d) => d.is_connected(),
            DeviceProtocol::Modbus(d) => d.is_connected(),
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        match self {
            DeviceProtocol::Iec61850(d) => d.connect().await,
            DeviceProtocol::Modbus(d) => d.connect().await,
        }
    }

    pub async fn disconnect(&mut self) {
        match self {
            DeviceProtocol::Iec61850(d) => d.disconnect().await,
            DeviceProtocol::Modbus(d) => d.disconnect().await,
        }
    }

    pub async fn discover(&mut self) -> Result<DiscoveryReport> {
        match self {
            DeviceProtocol::Iec61850(d) => d.discover().await,
            DeviceProtocol::Modbus(d) => d.discover().await,
        }
    }

    pub async fn read_signal(&mut self, address: &str) -> Result<Signal> {
        let path = strip_device_prefix(address);
        match self {
            DeviceProtocol::Iec61850(d) => d.read_signal(path).await,
            DeviceProtocol::Modbus(d) => d.read_signal(path).await,
        }
    }

    /// Read several signals, each distinct address once; unknown addresses
    /// are logged and left out
    pub async fn read_signals(&mut self, addresses: &[String]) -> Result<Vec<Signal>> {
        let mut paths: Vec<String> = Vec::with_capacity(addresses.len());
        for address in addresses {
            let path = strip_device_prefix(address);
            if !paths.iter().any(|p| p == path) {
                paths.push(path.to_string());
            }
        }
        match self {
            DeviceProtocol::Iec61850(d) => {
                let mut signals = Vec::with_capacity(paths.len());
                for path in &paths {
                    match d.read_signal(path).await {
                        Ok(signal) => signals.push(signal),
                        Err(e) => warn!(device = %d.name(), "Skipping read: {}", e),
                    }
                }
                Ok(signals)
            },
            DeviceProtocol::Modbus(d) => d.read_signals(&paths).await,
        }
    }

    pub async fn send_command(
        &mut self,
        address: &str,
        value: &SignalValue,
        options: &CommandOptions,
    ) -> Result<CommandReport> {
        let path = strip_device_prefix(address);
        match self {
            DeviceProtocol::Iec61850(d) => Ok(CommandReport::Control(
                d.send_command(path, value, options).await?,
            )),
            DeviceProtocol::Modbus(d) => {
                if options.force_direct || options.force_sbo {
                    warn!(device = %d.name(), "Control options have no meaning for Modbus writes");
                }
                Ok(CommandReport::Write(d.send_command(path, value).await?))
            },
        }
    }

    pub async fn select(
        &mut self,
        address: &str,
        value: &SignalValue,
        options: &CommandOptions,
    ) -> Result<ControlPath> {
        let path = strip_device_prefix(address);
        match self {
            DeviceProtocol::Iec61850(d) => Ok(d.select(path, value, options).await?),
            DeviceProtocol::Modbus(_) => Err(unsupported("select")),
        }
    }

    pub async fn operate(
        &mut self,
        address: &str,
        value: &SignalValue,
        options: &CommandOptions,
    ) -> Result<CommandOutcome> {
        let path = strip_device_prefix(address);
        match self {
            DeviceProtocol::Iec61850(d) => Ok(d.operate(path, value, options).await?),
            DeviceProtocol::Modbus(_) => Err(unsupported("operate")),
        }
    }

    pub async fn cancel(&mut self, address: &str) -> Result<()> {
        let path = strip_device_prefix(address);
        match self {
            DeviceProtocol::Iec61850(d) => Ok(d.cancel(path).await?),
            DeviceProtocol::Modbus(_) => Err(unsupported("cancel")),
        }
    }
}

fn unsupported(operation: &str) -> ScoutSrvError {
    ScoutSrvError::validation(format!("{operation} is not available on Modbus devices"))
}

impl From<Iec61850Device> for DeviceProtocol {
    fn from(device: Iec61850Device) -> Self {
        DeviceProtocol::Iec61850(device)
    }
}

impl From<ModbusDevice> for DeviceProtocol {
    fn from(device: ModbusDevice) -> Self {
        DeviceProtocol::Modbus(device)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::iec61850::adapter::Iec61850Settings;
    use crate::core::iec61850::simulator::SimulatedIed;
    use crate::core::modbus::adapter::PackingSettings;
    use crate::core::modbus::codec::RegisterDataType;
    use crate::core::modbus::packer::{FunctionCode, RegisterDefinition};
    use crate::core::modbus::transport::SimulatedModbus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn modbus() -> DeviceProtocol {
        let regs = vec![RegisterDefinition::new(
            "Setpoint",
            1,
            FunctionCode::HoldingRegisters,
            10,
            RegisterDataType::Uint16,
        )];
        ModbusDevice::new("PLC1", Box::new(SimulatedModbus::new()), regs, PackingSettings::default())
            .unwrap()
            .into()
    }

    #[tokio::test]
    async fn test_modbus_dispatch() {
        let mut device = modbus();
        assert_eq!(device.kind(), ProtocolKind::Modbus);
        device.connect().await.unwrap();
        device.discover().await.unwrap();

        let report = device
            .send_command("PLC1::1:3:10", &SignalValue::Int(42), &CommandOptions::default())
            .await
            .unwrap();
        assert!(matches!(report, CommandReport::Write(ref w) if w.function == 6));

        let signal = device.read_signal("PLC1::1:3:10").await.unwrap();
        assert_eq!(signal.value, Some(SignalValue::Int(42)));
        assert!(device.cancel("PLC1::1:3:10").await.is_err());
    }

    #[tokio::test]
    async fn test_iec_dispatch_skips_unknown_in_batch() {
        let ied = SimulatedIed::new("IED1").with_measurement("LD0", "MMXU1", "TotW", 3.0);
        let mut device: DeviceProtocol =
            Iec61850Device::new("IED1", Arc::new(ied), Iec61850Settings::default()).into();
        device.connect().await.unwrap();
        device.discover().await.unwrap();

        let signals = device
            .read_signals(&[
                "IED1::LD0/MMXU1.TotW.mag.f".to_string(),
                "IED1::LD0/MMXU1.Nope".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(device.kind().to_string(), "iec61850");
    }

    #[tokio::test]
    async fn test_iec_batch_reads_each_address_once() {
        let ied = SimulatedIed::new("IED1").with_measurement("LD0", "MMXU1", "TotW", 3.0);
        let mut device: DeviceProtocol =
            Iec61850Device::new("IED1", Arc::new(ied), Iec61850Settings::default()).into();
        device.connect().await.unwrap();
        device.discover().await.unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        device.updates().install(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let signals = device
            .read_signals(&[
                "IED1::LD0/MMXU1.TotW.mag.f".to_string(),
                "LD0/MMXU1.TotW.mag.f".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
