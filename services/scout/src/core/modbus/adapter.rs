//! Modbus device
//!
//! Owns the transport, the configured register list and its packed read
//! blocks. Reads go out as whole blocks and are split back into per-signal
//! updates; every signal touched by a read is emitted once through the
//! update slot, whether its block answered or not.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::codec::{self, RegisterDataType};
use super::packer::{
    pack, pack_writes, BlockData, FunctionCode, RegisterBlock, RegisterDefinition,
    MODBUS_MAX_WRITE_REGISTERS,
};
use super::transport::ModbusTransport;
use crate::core::iec61850::discovery::DiscoveryReport;
use crate::core::model::node::{Node, NodeKind};
use crate::core::model::signal::{ReadFailure, Signal, SignalKind, SignalType, SignalValue};
use crate::core::model::update::UpdateSlot;
use crate::error::{Result, ScoutSrvError};

/// Block packing limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackingSettings {
    pub max_block_size: u16,
    pub max_gap: u16,
}

impl Default for PackingSettings {
    fn default() -> Self {
        Self {
            max_block_size: 100,
            max_gap: 10,
        }
    }
}

/// Result of a successful Modbus write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub address: String,
    /// Write function used: 5, 6 or 16
    pub function: u8,
    /// Requests sent
    pub requests: usize,
}

pub struct ModbusDevice {
    name: String,
    transport: Box<dyn ModbusTransport>,
    registers: Vec<RegisterDefinition>,
    blocks: Vec<RegisterBlock>,
    packing: PackingSettings,
    tree: Arc<RwLock<Arc<Node>>>,
    live: HashMap<String, Signal>,
    /// Previous value per address for change detection; session state
    last_values: HashMap<String, SignalValue>,
    updates: UpdateSlot,
}

impl std::fmt::Debug for ModbusDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusDevice")
            .field("name", &self.name)
            .field("registers", &self.registers.len())
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

fn signal_for(register: &RegisterDefinition) -> Signal {
    let kind = match register.data_type {
        RegisterDataType::Bool => SignalKind::Binary,
        RegisterDataType::String(_) | RegisterDataType::Hex16 | RegisterDataType::Binary16 => {
            SignalKind::String
        },
        _ => SignalKind::Analog,
    };
    Signal::new(
        register.signal_address(),
        register.name.clone(),
        kind,
        SignalType::Modbus {
            data_type: register.data_type,
            byte_order: register.byte_order,
        },
    )
}

fn read_failure(err: &ScoutSrvError) -> ReadFailure {
    match err {
        ScoutSrvError::ConnectionError(_) => ReadFailure::NotConnected,
        _ => ReadFailure::Invalid,
    }
}

impl ModbusDevice {
    /// Build a device; the register list is packed once here
    pub fn new(
        name: impl Into<String>,
        transport: Box<dyn ModbusTransport>,
        registers: Vec<RegisterDefinition>,
        packing: PackingSettings,
    ) -> Result<Self> {
        let name = name.into();
        let blocks = pack(&registers, packing.max_block_size, packing.max_gap)?;
        info!(
            device = %name,
            registers = registers.len(),
            blocks = blocks.len(),
            "Register blocks packed"
        );
        Ok(Self {
            tree: Arc::new(RwLock::new(Arc::new(Node::new(name.clone(), NodeKind::Device)))),
            name,
            transport,
            registers,
            blocks,
            packing,
            live: HashMap::new(),
            last_values: HashMap::new(),
            updates: UpdateSlot::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn blocks(&self) -> &[RegisterBlock] {
        &self.blocks
    }

    pub fn registers(&self) -> &[RegisterDefinition] {
        &self.registers
    }

    pub fn updates(&self) -> &UpdateSlot {
        &self.updates
    }

    pub fn tree_handle(&self) -> Arc<RwLock<Arc<Node>>> {
        self.tree.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn last_value(&self, address: &str) -> Option<&SignalValue> {
        self.last_values.get(address)
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.transport.connect().await?;
        self.last_values.clear();
        info!(device = %self.name, "Connected");
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        self.transport.close().await;
        self.last_values.clear();
        for signal in self.live.values_mut() {
            signal.mark_stale();
        }
        info!(device = %self.name, "Disconnected");
    }

    /// Build the signal tree from the register list, one group per table
    pub async fn discover(&mut self) -> Result<DiscoveryReport> {
        let mut root = Node::new(self.name.clone(), NodeKind::Device);
        for function in [
            FunctionCode::Coils,
            FunctionCode::DiscreteInputs,
            FunctionCode::HoldingRegisters,
            FunctionCode::InputRegisters,
        ] {
            let mut group = Node::new(function.table_name(), NodeKind::Group);
            let mut registers: Vec<&RegisterDefinition> = self
                .registers
                .iter()
                .filter(|r| r.function_code == function)
                .collect();
            registers.sort_by_key(|r| (r.unit_id, r.address));
            for register in registers {
                group.push_signal(signal_for(register));
            }
            if !group.children.is_empty() {
                root.push_node(group);
            }
        }

        *self.tree.write() = Arc::new(root.clone());
        self.live.clear();
        info!(device = %self.name, signals = root.signal_count(), "Register tree built");
        Ok(DiscoveryReport {
            root,
            skipped: Vec::new(),
        })
    }

    fn register(&self, address: &str) -> Result<&RegisterDefinition> {
        self.registers
            .iter()
            .find(|r| r.signal_address() == address)
            .ok_or_else(|| ScoutSrvError::signal_not_found(address))
    }

    async fn read_block(&mut self, block: &RegisterBlock) -> Result<BlockData> {
        if block.function_code.is_bit() {
            self.transport
                .read_bits(block.unit_id, block.function_code, block.start, block.count)
                .await
                .map(BlockData::Bits)
        } else {
            self.transport
                .read_registers(block.unit_id, block.function_code, block.start, block.count)
                .await
                .map(BlockData::Registers)
        }
    }

    /// Apply one outcome to the live signal and emit it
    fn complete_read(&mut self, register: &RegisterDefinition, outcome: Result<SignalValue>) -> Signal {
        let address = register.signal_address();
        let mut signal = self
            .live
            .remove(&address)
            .unwrap_or_else(|| signal_for(register));

        match outcome {
            Ok(value) => {
                if self.last_values.get(&address) != Some(&value) {
                    debug!(device = %self.name, address = %address, value = %value, "Value changed");
                    self.last_values.insert(address.clone(), value.clone());
                }
                signal.apply_read(Ok(value));
            },
            Err(e) => {
                debug!(device = %self.name, address = %address, "Read failed: {}", e);
                signal.apply_read(Err(read_failure(&e)));
            },
        }

        self.updates.emit(&self.name, &signal);
        self.live.insert(address, signal.clone());
        signal
    }

    /// Read a set of signals with as few requests as packing allows
    ///
    /// Returns the updated signals in request order, one per distinct
    /// address. Unknown addresses are logged and left out.
    pub async fn read_signals(&mut self, addresses: &[String]) -> Result<Vec<Signal>> {
        let mut requested: Vec<&String> = Vec::with_capacity(addresses.len());
        let mut wanted: Vec<RegisterDefinition> = Vec::with_capacity(addresses.len());
        for address in addresses {
            if requested.contains(&address) {
                debug!(device = %self.name, address = %address, "Duplicate address in read request");
                continue;
            }
            requested.push(address);
            match self.register(address) {
                Ok(register) => wanted.push(register.clone()),
                Err(e) => warn!(device = %self.name, "Skipping read: {}", e),
            }
        }
        let blocks = pack(&wanted, self.packing.max_block_size, self.packing.max_gap)?;

        let mut results: HashMap<String, Signal> = HashMap::new();
        for block in &blocks {
            match self.read_block(block).await {
                Ok(data) => {
                    let values = block.demultiplex(&data);
                    for (mapping, (_, value)) in block.mappings.iter().zip(values) {
                        let signal = self.complete_read(&mapping.register, value);
                        results.insert(signal.address.clone(), signal);
                    }
                },
                Err(e) => {
                    warn!(device = %self.name, block = %block, "Block read failed: {}", e);
                    for mapping in &block.mappings {
                        let signal = self.complete_read(&mapping.register, Err(e.clone()));
                        results.insert(signal.address.clone(), signal);
                    }
                },
            }
        }

        Ok(requested
            .into_iter()
            .filter_map(|a| results.remove(a))
            .collect())
    }

    pub async fn read_signal(&mut self, address: &str) -> Result<Signal> {
        self.register(address)?;
        self.read_signals(&[address.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ScoutSrvError::signal_not_found(address))
    }

    /// Read every configured register using the precomputed blocks
    pub async fn read_all(&mut self) -> Vec<Signal> {
        let blocks = self.blocks.clone();
        let mut signals = Vec::new();
        for block in &blocks {
            let outcome = self.read_block(block).await;
            if let Err(e) = &outcome {
                warn!(device = %self.name, block = %block, "Block read failed: {}", e);
            }
            let values: Vec<Result<SignalValue>> = match &outcome {
                Ok(data) => block.demultiplex(data).into_iter().map(|(_, v)| v).collect(),
                Err(e) => block.mappings.iter().map(|_| Err(e.clone())).collect(),
            };
            for (mapping, value) in block.mappings.iter().zip(values) {
                signals.push(self.complete_read(&mapping.register, value));
            }
        }
        signals
    }

    /// Write a value: FC05 for coils, FC06 or FC16 for holding registers
    pub async fn send_command(&mut self, address: &str, value: &SignalValue) -> Result<WriteOutcome> {
        let register = self.register(address)?.clone();
        if !register.function_code.is_writable() {
            return Err(ScoutSrvError::validation(format!(
                "{address} is in the read-only {} table",
                register.function_code.table_name()
            )));
        }

        let outcome = if register.function_code == FunctionCode::Coils {
            let state = value
                .as_bool()
                .ok_or_else(|| ScoutSrvError::validation(format!("coil value must be boolean, got {value}")))?;
            self.transport
                .write_coil(register.unit_id, register.address, state)
                .await?;
            WriteOutcome {
                address: address.to_string(),
                function: 5,
                requests: 1,
            }
        } else {
            let words = codec::encode(value, register.data_type, register.byte_order, register.scaling)?;
            if let [word] = words.as_slice() {
                self.transport
                    .write_register(register.unit_id, register.address, *word)
                    .await?;
                WriteOutcome {
                    address: address.to_string(),
                    function: 6,
                    requests: 1,
                }
            } else {
                let runs = pack_writes(&[(register.address, words)], MODBUS_MAX_WRITE_REGISTERS);
                for run in &runs {
                    self.transport
                        .write_registers(register.unit_id, run.start, &run.values)
                        .await?;
                }
                WriteOutcome {
                    address: address.to_string(),
                    function: 16,
                    requests: runs.len(),
                }
            }
        };

        info!(
            device = %self.name,
            address = %address,
            function = outcome.function,
            value = %value,
            "Write complete"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::modbus::codec::ByteOrder;
    use crate::core::modbus::transport::{ModbusRequest, SimulatedModbus};
    use crate::core::model::signal::Quality;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registers() -> Vec<RegisterDefinition> {
        vec![
            RegisterDefinition::new("Breaker", 1, FunctionCode::Coils, 0, RegisterDataType::Bool),
            RegisterDefinition::new("V1", 1, FunctionCode::HoldingRegisters, 0, RegisterDataType::Uint16),
            RegisterDefinition::new("V2", 1, FunctionCode::HoldingRegisters, 1, RegisterDataType::Uint16),
            RegisterDefinition::new("P", 1, FunctionCode::HoldingRegisters, 2, RegisterDataType::Float32)
                .with_byte_order(ByteOrder::Cdab),
            RegisterDefinition::new("Far", 1, FunctionCode::HoldingRegisters, 200, RegisterDataType::Int16),
        ]
    }

    async fn device() -> (ModbusDevice, SimulatedModbus) {
        let slave = SimulatedModbus::new();
        let mut device = ModbusDevice::new(
            "PLC1",
            Box::new(slave.clone()),
            registers(),
            PackingSettings::default(),
        )
        .unwrap();
        device.connect().await.unwrap();
        (device, slave)
    }

    #[tokio::test]
    async fn test_discover_groups_by_table() {
        let (mut device, _) = device().await;
        let report = device.discover().await.unwrap();
        assert_eq!(report.signal_count(), 5);
        assert!(report.root.child("Coils").is_some());
        assert!(report.root.child("Holding Registers").is_some());
        assert!(report.root.child("Input Registers").is_none());
        assert_eq!(device.tree_handle().read().signal_count(), 5);
    }

    #[tokio::test]
    async fn test_read_all_uses_packed_blocks() {
        let (mut device, slave) = device().await;
        slave.set_registers(1, FunctionCode::HoldingRegisters, 0, &[10, 20]);
        slave.set_bit(1, FunctionCode::Coils, 0, true);
        slave.clear_requests();

        let signals = device.read_all().await;
        assert_eq!(signals.len(), 5);
        assert!(signals.iter().all(|s| s.quality == Quality::Good));
        let reads = slave
            .requests()
            .into_iter()
            .filter(|r| matches!(r, ModbusRequest::Read { .. }))
            .count();
        assert_eq!(reads, 3);
        assert_eq!(device.last_value("1:3:1"), Some(&SignalValue::Int(20)));
    }

    #[tokio::test]
    async fn test_failed_block_still_emits_every_signal() {
        let (mut device, slave) = device().await;
        slave.fail_address(FunctionCode::HoldingRegisters, 1, 2);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        device.updates().install(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let signals = device
            .read_signals(&["1:3:0".to_string(), "1:3:1".to_string(), "1:3:200".to_string()])
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(signals[0].quality, Quality::Invalid);
        assert_eq!(signals[1].quality, Quality::Invalid);
        assert_eq!(signals[2].quality, Quality::Good);
    }

    #[tokio::test]
    async fn test_duplicate_addresses_read_once() {
        let (mut device, slave) = device().await;
        slave.clear_requests();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        device.updates().install(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let signals = device
            .read_signals(&["1:3:0".to_string(), "1:3:1".to_string(), "1:3:0".to_string()])
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        let addresses: Vec<&str> = signals.iter().map(|s| s.address.as_str()).collect();
        assert_eq!(addresses, vec!["1:3:0", "1:3:1"]);
        assert_eq!(slave.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_writes_pick_function_code() {
        let (mut device, slave) = device().await;
        let coil = device.send_command("1:1:0", &SignalValue::Bool(true)).await.unwrap();
        assert_eq!(coil.function, 5);
        assert!(slave.bit(1, FunctionCode::Coils, 0));

        let single = device.send_command("1:3:1", &SignalValue::Int(7)).await.unwrap();
        assert_eq!(single.function, 6);

        let multi = device.send_command("1:3:2", &SignalValue::Float(1.5)).await.unwrap();
        assert_eq!(multi.function, 16);
        let p = device.read_signal("1:3:2").await.unwrap();
        assert_eq!(p.value, Some(SignalValue::Float(1.5)));
    }

    #[tokio::test]
    async fn test_disconnect_clears_change_cache() {
        let (mut device, _) = device().await;
        device.read_signal("1:3:0").await.unwrap();
        assert!(device.last_value("1:3:0").is_some());
        device.disconnect().await;
        assert!(device.last_value("1:3:0").is_none());

        let signal = device.read_signal("1:3:0").await.unwrap();
        assert_eq!(signal.quality, Quality::NotConnected);
        assert_eq!(signal.value, Some(SignalValue::Int(0)));
    }

    #[tokio::test]
    async fn test_read_only_table_rejects_write() {
        let slave = SimulatedModbus::new();
        let regs = vec![RegisterDefinition::new(
            "Temp",
            1,
            FunctionCode::InputRegisters,
            5,
            RegisterDataType::Int16,
        )];
        let mut device =
            ModbusDevice::new("PLC2", Box::new(slave), regs, PackingSettings::default()).unwrap();
        device.connect().await.unwrap();
        assert!(device.send_command("1:4:5", &SignalValue::Int(1)).await.is_err());
        assert!(device.send_command("1:3:5", &SignalValue::Int(1)).await.is_err());
    }
}
