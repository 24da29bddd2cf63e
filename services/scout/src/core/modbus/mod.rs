//! Modbus TCP side: register codec, block packer, CSV import, transport and device

pub mod adapter;
pub mod codec;
pub mod csv_import;
pub mod packer;
pub mod transport;

pub use adapter::{ModbusDevice, PackingSettings, WriteOutcome};
pub use codec::{ByteOrder, RegisterDataType, Scaling};
pub use packer::{pack, FunctionCode, RegisterBlock, RegisterDefinition};
pub use transport::{ModbusTransport, SimulatedModbus, TcpModbusTransport};
