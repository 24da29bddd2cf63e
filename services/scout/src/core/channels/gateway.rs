//! Protocol gateway
//!
//! Republishes live signal values as a Modbus register image. Each mapping
//! takes one `Device::address` source, applies `value * scale + offset` and
//! stores the result in a register table. The gateway is an ordinary
//! [`UpdateHub`] observer: it is fed by every completed read and never reads
//! a device itself.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, Trim, WriterBuilder};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::updates::{ObserverId, SignalUpdate, UpdateHub};
use crate::core::iec61850::reference::{device_address, split_device_address};
use crate::core::model::signal::SignalValue;
use crate::core::modbus::packer::FunctionCode;
use crate::error::{ErrorExt, Result, ScoutSrvError};

/// Destination register table of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterTable {
    Holding,
    Input,
    Coils,
    Discrete,
}

impl RegisterTable {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "holding" => Some(Self::Holding),
            "input" => Some(Self::Input),
            "coils" | "coil" => Some(Self::Coils),
            "discrete" => Some(Self::Discrete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Holding => "holding",
            Self::Input => "input",
            Self::Coils => "coils",
            Self::Discrete => "discrete",
        }
    }

    pub fn is_bit(self) -> bool {
        self.function_code().is_bit()
    }

    /// Read function that serves this table
    pub fn function_code(self) -> FunctionCode {
        match self {
            Self::Holding => FunctionCode::HoldingRegisters,
            Self::Input => FunctionCode::InputRegisters,
            Self::Coils => FunctionCode::Coils,
            Self::Discrete => FunctionCode::DiscreteInputs,
        }
    }
}

/// One source signal routed to one register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayMapping {
    /// `Device::address` of the source signal
    pub source: String,
    pub table: RegisterTable,
    pub address: u16,
    pub scale: f64,
    pub offset: f64,
    pub enabled: bool,
}

impl GatewayMapping {
    pub fn new(source: impl Into<String>, table: RegisterTable, address: u16) -> Self {
        Self {
            source: source.into(),
            table,
            address,
            scale: 1.0,
            offset: 0.0,
            enabled: true,
        }
    }

    pub fn with_scaling(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn id(&self) -> String {
        format!("{}->{}:{}", self.source, self.table.as_str(), self.address)
    }

    /// Register content for a source value, `None` when it has no numeric form
    /// or falls outside the table's range
    pub fn transform(&self, value: &SignalValue) -> Option<ImageValue> {
        let numeric = match value {
            SignalValue::Text(s) => s.trim().parse::<f64>().ok()?,
            other => other.as_f64()?,
        };
        let scaled = (numeric * self.scale + self.offset).trunc();
        if !scaled.is_finite() {
            return None;
        }
        if self.table.is_bit() {
            return Some(ImageValue::Bit(scaled != 0.0));
        }
        // Negative values are stored as their 16-bit two's complement
        if (f64::from(i16::MIN)..=f64::from(u16::MAX)).contains(&scaled) {
            let raw = scaled as i32;
            Some(ImageValue::Register(if raw < 0 { raw as i16 as u16 } else { raw as u16 }))
        } else {
            None
        }
    }
}

/// Content of one image cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ImageValue {
    Register(u16),
    Bit(bool),
}

/// One written image cell with its provenance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageEntry {
    pub table: RegisterTable,
    pub address: u16,
    pub value: ImageValue,
    pub mapping: String,
    pub updated_at: DateTime<Utc>,
}

/// Mapping plus the last value it wrote
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappingStatus {
    pub id: String,
    pub mapping: GatewayMapping,
    pub last_value: Option<ImageValue>,
    pub last_update: Option<DateTime<Utc>>,
}

pub struct ProtocolGateway {
    mappings: RwLock<BTreeMap<String, GatewayMapping>>,
    image: RwLock<BTreeMap<(RegisterTable, u16), ImageEntry>>,
    running: AtomicBool,
    subscription: Mutex<Option<ObserverId>>,
}

impl std::fmt::Debug for ProtocolGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolGateway")
            .field("mappings", &self.mappings.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ProtocolGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mappings: RwLock::new(BTreeMap::new()),
            image: RwLock::new(BTreeMap::new()),
            running: AtomicBool::new(false),
            subscription: Mutex::new(None),
        })
    }

    /// Add a mapping, replacing one with the same id
    ///
    /// The source must be a `Device::address` reference.
    pub fn add_mapping(&self, mapping: GatewayMapping) -> Result<String> {
        if split_device_address(&mapping.source).is_none() {
            return Err(ScoutSrvError::validation(format!(
                "gateway source '{}' lacks a 'Device::' prefix",
                mapping.source
            )));
        }
        if !mapping.scale.is_finite() || !mapping.offset.is_finite() {
            return Err(ScoutSrvError::validation(format!(
                "gateway mapping for '{}' has a non-finite scale or offset",
                mapping.source
            )));
        }
        let id = mapping.id();
        if let Some(other) = self
            .mappings
            .read()
            .values()
            .find(|m| m.table == mapping.table && m.address == mapping.address && m.id() != id)
        {
            warn!(
                table = mapping.table.as_str(),
                address = mapping.address,
                "Register also fed by {}",
                other.source
            );
        }
        info!(mapping = %id, "Gateway mapping added");
        self.mappings.write().insert(id.clone(), mapping);
        Ok(id)
    }

    pub fn remove_mapping(&self, id: &str) -> bool {
        let removed = self.mappings.write().remove(id).is_some();
        if removed {
            info!(mapping = %id, "Gateway mapping removed");
        }
        removed
    }

    pub fn set_mapping_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.mappings.write().get_mut(id) {
            Some(mapping) => {
                mapping.enabled = enabled;
                true
            },
            None => false,
        }
    }

    /// Mappings ordered by id
    pub fn mappings(&self) -> Vec<GatewayMapping> {
        self.mappings.read().values().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Subscribe to the hub and seed the image from its cached values
    pub fn start(self: &Arc<Self>, hub: &UpdateHub) {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            debug!("Gateway already started");
            return;
        }
        self.running.store(true, Ordering::Release);
        let gateway = Arc::clone(self);
        *subscription = Some(hub.subscribe(Arc::new(move |update| {
            gateway.apply(update);
        })));
        drop(subscription);

        let sources: Vec<String> = self.mappings.read().values().map(|m| m.source.clone()).collect();
        for source in sources {
            if let Some(update) = hub.latest(&source) {
                self.apply(&update);
            }
        }
        info!(mappings = self.mappings.read().len(), "Gateway started");
    }

    /// Leave the hub; the image keeps its last values
    pub fn stop(&self, hub: &UpdateHub) {
        self.running.store(false, Ordering::Release);
        if let Some(id) = self.subscription.lock().take() {
            hub.unsubscribe(id);
            info!("Gateway stopped");
        }
    }

    /// Write one update through every enabled mapping of its source
    ///
    /// Only good-quality values reach the image. Returns the number of cells
    /// written.
    pub fn apply(&self, update: &SignalUpdate) -> usize {
        if !self.is_running() || !update.signal.quality.is_good() {
            return 0;
        }
        let Some(value) = update.signal.value.as_ref() else {
            return 0;
        };
        let key = device_address(&update.device, &update.signal.address);
        let now = Utc::now();

        let mut written = 0;
        let mappings = self.mappings.read();
        for (id, mapping) in mappings.iter().filter(|(_, m)| m.enabled && m.source == key) {
            match mapping.transform(value) {
                Some(cell) => {
                    self.image.write().insert(
                        (mapping.table, mapping.address),
                        ImageEntry {
                            table: mapping.table,
                            address: mapping.address,
                            value: cell,
                            mapping: id.clone(),
                            updated_at: now,
                        },
                    );
                    written += 1;
                },
                None => debug!(mapping = %id, value = %value, "Value not representable in register"),
            }
        }
        written
    }

    pub fn value(&self, table: RegisterTable, address: u16) -> Option<ImageValue> {
        self.image.read().get(&(table, address)).map(|e| e.value)
    }

    /// Every written cell, ordered by table then address
    pub fn image(&self) -> Vec<ImageEntry> {
        self.image.read().values().cloned().collect()
    }

    pub fn status(&self, id: &str) -> Option<MappingStatus> {
        let mapping = self.mappings.read().get(id).cloned()?;
        let entry = self
            .image
            .read()
            .get(&(mapping.table, mapping.address))
            .filter(|e| e.mapping == id)
            .cloned();
        Some(MappingStatus {
            id: id.to_string(),
            mapping,
            last_value: entry.as_ref().map(|e| e.value),
            last_update: entry.map(|e| e.updated_at),
        })
    }

    /// Add every mapping in a CSV table; returns how many were added
    pub fn import_mappings<R: Read>(&self, reader: R) -> Result<usize> {
        let mut added = 0;
        for mapping in parse_mappings(reader)? {
            self.add_mapping(mapping)?;
            added += 1;
        }
        Ok(added)
    }

    pub fn load_mappings(&self, path: &Path) -> Result<usize> {
        let file = std::fs::File::open(path).io_error(&format!("open {}", path.display()))?;
        let count = self.import_mappings(file)?;
        info!(path = %path.display(), count, "Gateway mappings loaded");
        Ok(count)
    }

    /// Write the mapping table as CSV, in the layout `import_mappings` reads
    pub fn export_mappings<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = WriterBuilder::new().from_writer(writer);
        for mapping in self.mappings() {
            let (device, signal) = split_device_address(&mapping.source).unwrap_or_default();
            csv_writer
                .serialize(MappingRow {
                    source_device: device.to_string(),
                    source_signal: signal.to_string(),
                    dest_register_type: mapping.table.as_str().to_string(),
                    dest_address: mapping.address,
                    scale: Some(mapping.scale),
                    offset: Some(mapping.offset),
                    enabled: Some(mapping.enabled.to_string()),
                })
                .data_error("write gateway mapping")?;
        }
        csv_writer.flush().io_error("flush gateway mappings")?;
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MappingRow {
    source_device: String,
    source_signal: String,
    dest_register_type: String,
    dest_address: u16,
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    offset: Option<f64>,
    #[serde(default)]
    enabled: Option<String>,
}

impl MappingRow {
    fn into_mapping(self) -> std::result::Result<GatewayMapping, String> {
        let table = RegisterTable::parse(&self.dest_register_type)
            .ok_or_else(|| format!("unknown register type '{}'", self.dest_register_type))?;
        let enabled = match self.enabled.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(v) => v.eq_ignore_ascii_case("true"),
        };
        Ok(GatewayMapping {
            source: device_address(self.source_device.trim(), self.source_signal.trim()),
            table,
            address: self.dest_address,
            scale: self.scale.unwrap_or(1.0),
            offset: self.offset.unwrap_or(0.0),
            enabled,
        })
    }
}

/// Parse a mapping table; malformed rows are logged and skipped
pub fn parse_mappings<R: Read>(reader: R) -> Result<Vec<GatewayMapping>> {
    let mut csv_reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader);
    let headers = csv_reader.headers()?.clone();

    let mut mappings = Vec::new();
    for (i, record) in csv_reader.records().enumerate() {
        let line = i + 2;
        let parsed = record
            .map_err(|e| e.to_string())
            .and_then(|r| r.deserialize::<MappingRow>(Some(&headers)).map_err(|e| e.to_string()))
            .and_then(MappingRow::into_mapping);
        match parsed {
            Ok(mapping) => mappings.push(mapping),
            Err(reason) => warn!(line, "Skipping gateway mapping: {}", reason),
        }
    }
    Ok(mappings)
}
