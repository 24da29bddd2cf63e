pub mod channels;
pub mod iec61850;
pub mod model;
pub mod modbus;
