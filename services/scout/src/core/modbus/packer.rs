//! Register-block packer
//!
//! Turns a flat register list into the fewest contiguous read requests that
//! respect a maximum block size and a maximum tolerated gap. Each block keeps
//! the offset of every register it covers so a bulk read can be split back
//! into per-signal values.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::codec::{self, ByteOrder, RegisterDataType, Scaling};
use crate::core::model::signal::SignalValue;
use crate::error::{Result, ScoutSrvError};

/// Maximum registers per FC03/FC04 request
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;
/// Maximum registers per FC16 request
pub const MODBUS_MAX_WRITE_REGISTERS: u16 = 123;
/// Maximum bits per FC01/FC02 request
pub const MODBUS_MAX_READ_COILS: u16 = 2000;

/// Modbus read function
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FunctionCode {
    /// FC01
    Coils,
    /// FC02
    DiscreteInputs,
    /// FC03
    HoldingRegisters,
    /// FC04
    InputRegisters,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            Self::Coils => 1,
            Self::DiscreteInputs => 2,
            Self::HoldingRegisters => 3,
            Self::InputRegisters => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Coils),
            2 => Some(Self::DiscreteInputs),
            3 => Some(Self::HoldingRegisters),
            4 => Some(Self::InputRegisters),
            _ => None,
        }
    }

    /// Bit-addressed table (coils, discrete inputs)
    pub fn is_bit(self) -> bool {
        matches!(self, Self::Coils | Self::DiscreteInputs)
    }

    /// Coils and holding registers accept writes
    pub fn is_writable(self) -> bool {
        matches!(self, Self::Coils | Self::HoldingRegisters)
    }

    /// Protocol ceiling for one read request
    pub fn max_read(self) -> u16 {
        if self.is_bit() {
            MODBUS_MAX_READ_COILS
        } else {
            MODBUS_MAX_READ_REGISTERS
        }
    }

    pub fn table_name(self) -> &'static str {
        match self {
            Self::Coils => "Coils",
            Self::DiscreteInputs => "Discrete Inputs",
            Self::HoldingRegisters => "Holding Registers",
            Self::InputRegisters => "Input Registers",
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FC{:02}", self.code())
    }
}

/// One configured register (or bit) and how to interpret it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDefinition {
    pub name: String,
    pub unit_id: u8,
    pub function_code: FunctionCode,
    pub address: u16,
    pub data_type: RegisterDataType,
    pub byte_order: ByteOrder,
    pub scaling: Scaling,
}

impl RegisterDefinition {
    pub fn new(
        name: impl Into<String>,
        unit_id: u8,
        function_code: FunctionCode,
        address: u16,
        data_type: RegisterDataType,
    ) -> Self {
        let data_type = if function_code.is_bit() {
            RegisterDataType::Bool
        } else {
            data_type
        };
        Self {
            name: name.into(),
            unit_id,
            function_code,
            address,
            data_type,
            byte_order: ByteOrder::default(),
            scaling: Scaling::default(),
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_scaling(mut self, scaling: Scaling) -> Self {
        self.scaling = scaling;
        self
    }

    /// Registers (or bits) occupied
    pub fn width(&self) -> u16 {
        if self.function_code.is_bit() {
            1
        } else {
            self.data_type.register_count()
        }
    }

    /// First address past this register
    fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.width())
    }

    /// Device-local signal address `unit:fc:address`
    pub fn signal_address(&self) -> String {
        format!("{}:{}:{}", self.unit_id, self.function_code.code(), self.address)
    }
}

/// Parsed `unit:fc:address`
pub fn parse_signal_address(address: &str) -> Option<(u8, FunctionCode, u16)> {
    let mut parts = address.split(':');
    let unit = parts.next()?.trim().parse().ok()?;
    let fc = FunctionCode::from_code(parts.next()?.trim().parse().ok()?)?;
    let addr = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((unit, fc, addr))
}

/// Register placed at `offset` within a block
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockMapping {
    pub offset: u16,
    pub register: RegisterDefinition,
}

/// Raw result of one block read
#[derive(Debug, Clone, PartialEq)]
pub enum BlockData {
    Bits(Vec<bool>),
    Registers(Vec<u16>),
}

/// Contiguous run of one function code, read as a single request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterBlock {
    pub unit_id: u8,
    pub function_code: FunctionCode,
    pub start: u16,
    pub count: u16,
    /// Ordered by offset
    pub mappings: Vec<BlockMapping>,
}

impl RegisterBlock {
    fn open(register: RegisterDefinition) -> Self {
        Self {
            unit_id: register.unit_id,
            function_code: register.function_code,
            start: register.address,
            count: register.width(),
            mappings: vec![BlockMapping {
                offset: 0,
                register,
            }],
        }
    }

    fn end(&self) -> u32 {
        u32::from(self.start) + u32::from(self.count)
    }

    /// Last covered address, inclusive
    pub fn last_address(&self) -> u16 {
        self.start.saturating_add(self.count.saturating_sub(1))
    }

    fn push(&mut self, register: RegisterDefinition) {
        let offset = register.address - self.start;
        let end = register.end().max(self.end());
        self.count = (end - u32::from(self.start)) as u16;
        self.mappings.push(BlockMapping { offset, register });
    }

    /// Split a block read back into per-signal values, keyed by signal address
    pub fn demultiplex(&self, data: &BlockData) -> Vec<(String, Result<SignalValue>)> {
        self.mappings
            .iter()
            .map(|m| {
                let offset = usize::from(m.offset);
                let value = match data {
                    BlockData::Bits(bits) => bits
                        .get(offset)
                        .map(|b| SignalValue::Bool(*b))
                        .ok_or_else(|| short_response(self, bits.len())),
                    BlockData::Registers(words) => {
                        let width = usize::from(m.register.width());
                        match words.get(offset..offset + width) {
                            Some(slice) => codec::decode(
                                slice,
                                m.register.data_type,
                                m.register.byte_order,
                                m.register.scaling,
                            ),
                            None => Err(short_response(self, words.len())),
                        }
                    },
                };
                (m.register.signal_address(), value)
            })
            .collect()
    }
}

fn short_response(block: &RegisterBlock, got: usize) -> ScoutSrvError {
    ScoutSrvError::protocol(format!(
        "short response for {} {}..{}: {} of {} values",
        block.function_code,
        block.start,
        block.last_address(),
        got,
        block.count
    ))
}

impl fmt::Display for RegisterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unit {} {} [{}-{}] ({} x {})",
            self.unit_id,
            self.function_code,
            self.start,
            self.last_address(),
            self.count,
            if self.function_code.is_bit() { "bits" } else { "registers" },
        )
    }
}

/// Pack registers into read blocks
///
/// Registers are grouped by unit and function code, sorted by address and
/// scanned in order. A register joins the open block when the gap from the
/// block's end is at most `max_gap` and the grown block stays within
/// `max_block_size` (further capped by the protocol limit of the function
/// code). Overlapping definitions share registers.
pub fn pack(
    registers: &[RegisterDefinition],
    max_block_size: u16,
    max_gap: u16,
) -> Result<Vec<RegisterBlock>> {
    if max_block_size == 0 {
        return Err(ScoutSrvError::validation("max_block_size must be at least 1"));
    }

    let mut sorted: Vec<&RegisterDefinition> = registers.iter().collect();
    sorted.sort_by_key(|r| (r.unit_id, r.function_code, r.address));

    let mut blocks: Vec<RegisterBlock> = Vec::new();
    for register in sorted {
        let limit = max_block_size.min(register.function_code.max_read());
        if register.width() > limit {
            return Err(ScoutSrvError::validation(format!(
                "{} at {} needs {} registers, block limit is {}",
                register.name,
                register.address,
                register.width(),
                limit
            )));
        }
        if register.end() > 0x1_0000 {
            return Err(ScoutSrvError::validation(format!(
                "{} at {} runs past the end of the address space",
                register.name, register.address
            )));
        }

        let joins = blocks.last().is_some_and(|block| {
            block.unit_id == register.unit_id
                && block.function_code == register.function_code
                && u32::from(register.address).saturating_sub(block.end()) <= u32::from(max_gap)
                && register.end().max(block.end()) - u32::from(block.start) <= u32::from(limit)
        });

        match blocks.last_mut() {
            Some(block) if joins => block.push(register.clone()),
            _ => blocks.push(RegisterBlock::open(register.clone())),
        }
    }

    debug!(
        registers = registers.len(),
        blocks = blocks.len(),
        max_block_size,
        max_gap,
        "Register list packed"
    );
    Ok(blocks)
}

/// Contiguous run of register values written with one FC16 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBlock {
    pub start: u16,
    pub values: Vec<u16>,
}

/// Merge register writes into contiguous FC16 runs
///
/// Writes cannot skip registers, so only exactly adjacent runs merge. A later
/// write to an already covered address wins.
pub fn pack_writes(writes: &[(u16, Vec<u16>)], max_block_size: u16) -> Vec<WriteBlock> {
    let limit = usize::from(max_block_size.clamp(1, MODBUS_MAX_WRITE_REGISTERS));

    let mut cells: std::collections::BTreeMap<u32, u16> = std::collections::BTreeMap::new();
    for (address, values) in writes {
        for (i, value) in values.iter().enumerate() {
            cells.insert(u32::from(*address) + i as u32, *value);
        }
    }

    let mut blocks: Vec<WriteBlock> = Vec::new();
    for (address, value) in cells {
        if address > u32::from(u16::MAX) {
            break;
        }
        match blocks.last_mut() {
            Some(block)
                if u32::from(block.start) + block.values.len() as u32 == address
                    && block.values.len() < limit =>
            {
                block.values.push(value);
            },
            _ => blocks.push(WriteBlock {
                start: address as u16,
                values: vec![value],
            }),
        }
    }
    blocks
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn holding(address: u16) -> RegisterDefinition {
        RegisterDefinition::new(
            format!("R{address}"),
            1,
            FunctionCode::HoldingRegisters,
            address,
            RegisterDataType::Uint16,
        )
    }

    fn spans(blocks: &[RegisterBlock]) -> Vec<(u16, u16)> {
        blocks.iter().map(|b| (b.start, b.last_address())).collect()
    }

    #[test]
    fn test_gap_splits_blocks() {
        let regs: Vec<_> = [0, 1, 2, 50, 51, 200].into_iter().map(holding).collect();
        let blocks = pack(&regs, 100, 10).unwrap();
        assert_eq!(spans(&blocks), vec![(0, 2), (50, 51), (200, 200)]);
        assert_eq!(blocks[1].mappings.iter().map(|m| m.offset).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_small_gap_is_bridged() {
        let regs: Vec<_> = [0, 5, 12].into_iter().map(holding).collect();
        let blocks = pack(&regs, 100, 6).unwrap();
        assert_eq!(spans(&blocks), vec![(0, 12)]);
        assert_eq!(blocks[0].count, 13);
        assert_eq!(blocks[0].mappings[2].offset, 12);
    }

    #[test]
    fn test_block_size_cap() {
        let regs: Vec<_> = (0..10).map(holding).collect();
        let blocks = pack(&regs, 4, 10).unwrap();
        assert_eq!(spans(&blocks), vec![(0, 3), (4, 7), (8, 9)]);
        assert!(blocks.iter().all(|b| b.count <= 4));
    }

    #[test]
    fn test_protocol_limit_caps_configured_size() {
        let regs: Vec<_> = (0..130).map(holding).collect();
        let blocks = pack(&regs, 500, 0).unwrap();
        assert_eq!(blocks[0].count, MODBUS_MAX_READ_REGISTERS);
    }

    #[test]
    fn test_function_codes_never_mix() {
        let mut regs = vec![holding(0), holding(1)];
        regs.push(RegisterDefinition::new("IR", 1, FunctionCode::InputRegisters, 2, RegisterDataType::Int16));
        regs.push(RegisterDefinition::new("C", 1, FunctionCode::Coils, 0, RegisterDataType::Bool));
        let blocks = pack(&regs, 100, 10).unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].function_code, FunctionCode::Coils);
    }

    #[test]
    fn test_multi_register_width_counts() {
        let regs = vec![
            RegisterDefinition::new("F", 1, FunctionCode::HoldingRegisters, 10, RegisterDataType::Float32),
            RegisterDefinition::new("D", 1, FunctionCode::HoldingRegisters, 12, RegisterDataType::Float64),
        ];
        let blocks = pack(&regs, 100, 0).unwrap();
        assert_eq!(spans(&blocks), vec![(10, 15)]);
        assert_eq!(blocks[0].count, 6);
    }

    #[test]
    fn test_too_wide_register_rejected() {
        let regs = vec![RegisterDefinition::new(
            "S",
            1,
            FunctionCode::HoldingRegisters,
            0,
            RegisterDataType::String(20),
        )];
        assert!(pack(&regs, 4, 0).is_err());
        assert!(pack(&regs, 0, 0).is_err());
    }

    #[test]
    fn test_demultiplex() {
        let regs = vec![
            holding(0),
            RegisterDefinition::new("F", 1, FunctionCode::HoldingRegisters, 2, RegisterDataType::Float32),
        ];
        let blocks = pack(&regs, 100, 5).unwrap();
        let values = blocks[0].demultiplex(&BlockData::Registers(vec![7, 0, 0x41C8, 0x0000]));
        assert_eq!(values[0].0, "1:3:0");
        assert_eq!(values[0].1.as_ref().unwrap(), &SignalValue::Int(7));
        assert_eq!(values[1].1.as_ref().unwrap(), &SignalValue::Float(25.0));

        let short = blocks[0].demultiplex(&BlockData::Registers(vec![7]));
        assert!(short[0].1.is_ok());
        assert!(short[1].1.is_err());
    }

    #[test]
    fn test_signal_address_round_trip() {
        assert_eq!(parse_signal_address("1:3:40"), Some((1, FunctionCode::HoldingRegisters, 40)));
        assert_eq!(parse_signal_address("1:7:40"), None);
        assert_eq!(parse_signal_address("1:3"), None);
    }

    #[test]
    fn test_pack_writes_merges_adjacent() {
        let writes = vec![(10, vec![1, 2]), (12, vec![3]), (20, vec![4])];
        let blocks = pack_writes(&writes, 100);
        assert_eq!(
            blocks,
            vec![
                WriteBlock { start: 10, values: vec![1, 2, 3] },
                WriteBlock { start: 20, values: vec![4] },
            ]
        );
    }
}
