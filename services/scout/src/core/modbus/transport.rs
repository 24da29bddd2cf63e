//! Modbus transports
//!
//! `ModbusTransport` is the request-level seam the device adapter talks to.
//! `TcpModbusTransport` drives a real slave through `voltage_modbus`;
//! `SimulatedModbus` serves an in-memory register bank and records requests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use voltage_modbus::{ModbusClient, ModbusTcpClient};

use super::packer::FunctionCode;
use crate::error::{ErrorExt, Result, ScoutSrvError};

/// Human-readable name of a Modbus exception code
pub fn exception_name(code: u8) -> &'static str {
    match code {
        1 => "Illegal Function",
        2 => "Illegal Data Address",
        3 => "Illegal Data Value",
        4 => "Slave Device Failure",
        5 => "Acknowledge",
        6 => "Slave Device Busy",
        8 => "Memory Parity Error",
        10 => "Gateway Path Unavailable",
        11 => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

/// Error for an exception response
pub fn exception_error(function: u8, code: u8) -> ScoutSrvError {
    ScoutSrvError::protocol(format!(
        "Modbus exception {code} ({}) on FC{function:02}",
        exception_name(code)
    ))
}

/// Request-level Modbus access
#[async_trait]
pub trait ModbusTransport: Send {
    async fn connect(&mut self) -> Result<()>;

    async fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// FC01/FC02
    async fn read_bits(&mut self, unit: u8, function: FunctionCode, start: u16, count: u16) -> Result<Vec<bool>>;

    /// FC03/FC04
    async fn read_registers(
        &mut self,
        unit: u8,
        function: FunctionCode,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>>;

    /// FC05
    async fn write_coil(&mut self, unit: u8, address: u16, value: bool) -> Result<()>;

    /// FC06
    async fn write_register(&mut self, unit: u8, address: u16, value: u16) -> Result<()>;

    /// FC16
    async fn write_registers(&mut self, unit: u8, start: u16, values: &[u16]) -> Result<()>;
}

// ============================================================================
// TCP transport
// ============================================================================

/// Modbus TCP client
pub struct TcpModbusTransport {
    address: String,
    timeout: Duration,
    client: Option<ModbusTcpClient>,
}

impl std::fmt::Debug for TcpModbusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpModbusTransport")
            .field("address", &self.address)
            .field("connected", &self.client.is_some())
            .finish()
    }
}

impl TcpModbusTransport {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            client: None,
        }
    }

    fn take_client(&mut self) -> Result<ModbusTcpClient> {
        self.client.take().ok_or_else(ScoutSrvError::not_connected)
    }

    /// Return the session after a request; a timed-out session is dropped
    fn restore<T>(&mut self, client: ModbusTcpClient, result: &Result<T>) {
        if matches!(result, Err(ScoutSrvError::TimeoutError(_))) {
            warn!(address = %self.address, "Modbus request timed out, dropping session");
        } else {
            self.client = Some(client);
        }
    }
}

/// Bound a request by `timeout`
async fn timed<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, voltage_modbus::ModbusError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.protocol_error(what),
        Err(_) => Err(ScoutSrvError::timeout(format!(
            "{what}: no response within {} ms",
            timeout.as_millis()
        ))),
    }
}

#[async_trait]
impl ModbusTransport for TcpModbusTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let connect = ModbusTcpClient::from_address(&self.address, self.timeout);
        let client = match tokio::time::timeout(self.timeout, connect).await {
            Ok(result) => result.connection_error(&format!("connect {}", self.address))?,
            Err(_) => {
                return Err(ScoutSrvError::timeout(format!(
                    "connect {}: no response within {} ms",
                    self.address,
                    self.timeout.as_millis()
                )))
            },
        };
        info!(address = %self.address, "Modbus TCP connected");
        self.client = Some(client);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut client) = self.client.take() {
            if let Err(e) = client.close().await {
                debug!(address = %self.address, "Close failed: {}", e);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    async fn read_bits(&mut self, unit: u8, function: FunctionCode, start: u16, count: u16) -> Result<Vec<bool>> {
        let what = format!("{function} {start}+{count}");
        let mut client = self.take_client()?;
        let result = match function {
            FunctionCode::Coils => timed(self.timeout, &what, client.read_01(unit, start, count)).await,
            _ => timed(self.timeout, &what, client.read_02(unit, start, count)).await,
        };
        self.restore(client, &result);
        result
    }

    async fn read_registers(
        &mut self,
        unit: u8,
        function: FunctionCode,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let what = format!("{function} {start}+{count}");
        let mut client = self.take_client()?;
        let result = match function {
            FunctionCode::InputRegisters => timed(self.timeout, &what, client.read_04(unit, start, count)).await,
            _ => timed(self.timeout, &what, client.read_03(unit, start, count)).await,
        };
        self.restore(client, &result);
        result
    }

    async fn write_coil(&mut self, unit: u8, address: u16, value: bool) -> Result<()> {
        let what = format!("FC05 {address}");
        let mut client = self.take_client()?;
        let result = timed(self.timeout, &what, client.write_05(unit, address, value)).await;
        self.restore(client, &result);
        result.map(|_| ())
    }

    async fn write_register(&mut self, unit: u8, address: u16, value: u16) -> Result<()> {
        let what = format!("FC06 {address}");
        let mut client = self.take_client()?;
        let result = timed(self.timeout, &what, client.write_06(unit, address, value)).await;
        self.restore(client, &result);
        result.map(|_| ())
    }

    async fn write_registers(&mut self, unit: u8, start: u16, values: &[u16]) -> Result<()> {
        let what = format!("FC16 {start}+{}", values.len());
        let mut client = self.take_client()?;
        let result = timed(self.timeout, &what, client.write_10(unit, start, values)).await;
        self.restore(client, &result);
        result.map(|_| ())
    }
}

// ============================================================================
// Simulated slave
// ============================================================================

/// Request observed by the simulated slave
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    Read {
        unit: u8,
        function: FunctionCode,
        start: u16,
        count: u16,
    },
    WriteCoil {
        unit: u8,
        address: u16,
        value: bool,
    },
    WriteRegister {
        unit: u8,
        address: u16,
        value: u16,
    },
    WriteRegisters {
        unit: u8,
        start: u16,
        values: Vec<u16>,
    },
}

#[derive(Debug, Default)]
struct SlaveState {
    online: bool,
    connected: bool,
    bits: HashMap<(u8, FunctionCode, u16), bool>,
    registers: HashMap<(u8, FunctionCode, u16), u16>,
    exceptions: HashMap<(FunctionCode, u16), u8>,
    unresponsive: HashSet<FunctionCode>,
    requests: Vec<ModbusRequest>,
}

/// In-memory Modbus slave
///
/// Clones share the register bank, so a test can keep one handle for
/// inspection while the device owns another.
#[derive(Debug, Clone)]
pub struct SimulatedModbus {
    state: Arc<Mutex<SlaveState>>,
}

impl Default for SimulatedModbus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedModbus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SlaveState {
                online: true,
                ..Default::default()
            })),
        }
    }

    pub fn set_bit(&self, unit: u8, function: FunctionCode, address: u16, value: bool) {
        self.state.lock().bits.insert((unit, function, address), value);
    }

    pub fn set_registers(&self, unit: u8, function: FunctionCode, start: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (i, v) in values.iter().enumerate() {
            state.registers.insert((unit, function, start + i as u16), *v);
        }
    }

    pub fn bit(&self, unit: u8, function: FunctionCode, address: u16) -> bool {
        self.state
            .lock()
            .bits
            .get(&(unit, function, address))
            .copied()
            .unwrap_or(false)
    }

    pub fn register(&self, unit: u8, function: FunctionCode, address: u16) -> u16 {
        self.state
            .lock()
            .registers
            .get(&(unit, function, address))
            .copied()
            .unwrap_or(0)
    }

    /// Any request touching `address` answers with exception `code`
    pub fn fail_address(&self, function: FunctionCode, address: u16, code: u8) {
        self.state.lock().exceptions.insert((function, address), code);
    }

    /// Requests for `function` never answer
    pub fn set_unresponsive(&self, function: FunctionCode, unresponsive: bool) {
        let mut state = self.state.lock();
        if unresponsive {
            state.unresponsive.insert(function);
        } else {
            state.unresponsive.remove(&function);
        }
    }

    /// Take the slave off the network; open sessions drop
    pub fn set_online(&self, online: bool) {
        let mut state = self.state.lock();
        state.online = online;
        if !online {
            state.connected = false;
        }
    }

    pub fn requests(&self) -> Vec<ModbusRequest> {
        self.state.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().requests.clear();
    }

    fn check(&self, function: FunctionCode, start: u16, count: u16, code: u8) -> Result<bool> {
        let state = self.state.lock();
        if !state.connected {
            return Err(ScoutSrvError::not_connected());
        }
        if let Some((_, exception)) = state
            .exceptions
            .iter()
            .find(|((f, a), _)| *f == function && *a >= start && u32::from(*a) < u32::from(start) + u32::from(count))
        {
            return Err(exception_error(code, *exception));
        }
        Ok(state.unresponsive.contains(&function))
    }

    async fn gate(&self, function: FunctionCode, start: u16, count: u16, code: u8) -> Result<()> {
        if self.check(function, start, count, code)? {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl ModbusTransport for SimulatedModbus {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.online {
            return Err(ScoutSrvError::connection("simulated slave is offline"));
        }
        state.connected = true;
        Ok(())
    }

    async fn close(&mut self) {
        self.state.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn read_bits(&mut self, unit: u8, function: FunctionCode, start: u16, count: u16) -> Result<Vec<bool>> {
        self.state.lock().requests.push(ModbusRequest::Read {
            unit,
            function,
            start,
            count,
        });
        self.gate(function, start, count, function.code()).await?;
        Ok((0..count).map(|i| self.bit(unit, function, start + i)).collect())
    }

    async fn read_registers(
        &mut self,
        unit: u8,
        function: FunctionCode,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        self.state.lock().requests.push(ModbusRequest::Read {
            unit,
            function,
            start,
            count,
        });
        self.gate(function, start, count, function.code()).await?;
        Ok((0..count)
            .map(|i| self.register(unit, function, start + i))
            .collect())
    }

    async fn write_coil(&mut self, unit: u8, address: u16, value: bool) -> Result<()> {
        self.state.lock().requests.push(ModbusRequest::WriteCoil {
            unit,
            address,
            value,
        });
        self.gate(FunctionCode::Coils, address, 1, 5).await?;
        self.set_bit(unit, FunctionCode::Coils, address, value);
        Ok(())
    }

    async fn write_register(&mut self, unit: u8, address: u16, value: u16) -> Result<()> {
        self.state.lock().requests.push(ModbusRequest::WriteRegister {
            unit,
            address,
            value,
        });
        self.gate(FunctionCode::HoldingRegisters, address, 1, 6).await?;
        self.set_registers(unit, FunctionCode::HoldingRegisters, address, &[value]);
        Ok(())
    }

    async fn write_registers(&mut self, unit: u8, start: u16, values: &[u16]) -> Result<()> {
        self.state.lock().requests.push(ModbusRequest::WriteRegisters {
            unit,
            start,
            values: values.to_vec(),
        });
        self.gate(FunctionCode::HoldingRegisters, start, values.len() as u16, 16)
            .await?;
        self.set_registers(unit, FunctionCode::HoldingRegisters, start, values);
        Ok(())
    }
}
