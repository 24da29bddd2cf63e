//! Register table import
//!
//! Reads register definitions from CSV. Required columns are `Index`,
//! `PointType` and `Name`; `IsEnabled`, `DataType`, `Endianness`, `Scale` and
//! `Offset` are optional. Point types: 1 coil, 2 discrete input, 3 input
//! register, 4 holding register.

use std::io::Read;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Trim};
use serde::Deserialize;
use tracing::{info, warn};

use super::codec::{ByteOrder, RegisterDataType, Scaling};
use super::packer::{FunctionCode, RegisterDefinition};
use crate::error::{ErrorExt, Result, ScoutSrvError};

const REQUIRED_COLUMNS: [&str; 3] = ["Index", "PointType", "Name"];

#[derive(Debug, Deserialize)]
struct RegisterRow {
    #[serde(rename = "IsEnabled", default)]
    enabled: Option<String>,
    #[serde(rename = "Index")]
    index: u16,
    #[serde(rename = "PointType")]
    point_type: u8,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "DataType", default)]
    data_type: Option<String>,
    #[serde(rename = "Endianness", default)]
    endianness: Option<String>,
    #[serde(rename = "Scale", default)]
    scale: Option<String>,
    #[serde(rename = "Offset", default)]
    offset: Option<String>,
}

/// Map a table point type to its read function
pub fn function_code_for_point_type(point_type: u8) -> Option<FunctionCode> {
    match point_type {
        1 => Some(FunctionCode::Coils),
        2 => Some(FunctionCode::DiscreteInputs),
        3 => Some(FunctionCode::InputRegisters),
        4 => Some(FunctionCode::HoldingRegisters),
        _ => None,
    }
}

fn is_enabled(flag: Option<&str>) -> bool {
    match flag.map(str::trim) {
        None | Some("") => true,
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "y"),
    }
}

fn optional_f64(field: Option<&str>, default: f64) -> std::result::Result<f64, String> {
    match field.map(str::trim) {
        None | Some("") => Ok(default),
        Some(v) => v.parse().map_err(|_| format!("'{v}' is not a number")),
    }
}

impl RegisterRow {
    fn into_definition(self, unit_id: u8) -> std::result::Result<Option<RegisterDefinition>, String> {
        if !is_enabled(self.enabled.as_deref()) {
            return Ok(None);
        }

        let function_code = function_code_for_point_type(self.point_type)
            .ok_or_else(|| format!("point type {} is not 1-4", self.point_type))?;

        let data_type = match self.data_type.as_deref().map(str::trim) {
            None | Some("") => RegisterDataType::Uint16,
            Some(s) => RegisterDataType::parse(s).ok_or_else(|| format!("unknown data type '{s}'"))?,
        };
        let byte_order = match self.endianness.as_deref() {
            None => ByteOrder::default(),
            Some(s) => ByteOrder::parse(s).ok_or_else(|| format!("unknown endianness '{s}'"))?,
        };
        let scaling = Scaling {
            scale: optional_f64(self.scale.as_deref(), 1.0)?,
            offset: optional_f64(self.offset.as_deref(), 0.0)?,
        };

        Ok(Some(
            RegisterDefinition::new(self.name.trim(), unit_id, function_code, self.index, data_type)
                .with_byte_order(byte_order)
                .with_scaling(scaling),
        ))
    }
}

/// Parse register definitions from any reader
///
/// Disabled rows are dropped. Malformed rows are logged and skipped; a
/// missing required column fails the whole import.
pub fn parse_registers<R: Read>(reader: R, unit_id: u8) -> Result<Vec<RegisterDefinition>> {
    let mut csv_reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers: StringRecord = csv_reader.headers()?.clone();
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|col| !headers.iter().any(|h| h == *col))
        .collect();
    if !missing.is_empty() {
        return Err(ScoutSrvError::config(format!(
            "register table is missing columns: {}",
            missing.join(", ")
        )));
    }

    let mut registers = Vec::new();
    for (i, record) in csv_reader.records().enumerate() {
        // Header is line 1
        let line = i + 2;
        let parsed = record
            .map_err(|e| e.to_string())
            .and_then(|r| r.deserialize::<RegisterRow>(Some(&headers)).map_err(|e| e.to_string()))
            .and_then(|row| row.into_definition(unit_id));
        match parsed {
            Ok(Some(register)) => registers.push(register),
            Ok(None) => {},
            Err(reason) => warn!(line, "Skipping register row: {}", reason),
        }
    }

    Ok(registers)
}

/// Load register definitions from a CSV file
pub fn load_registers(path: &Path, unit_id: u8) -> Result<Vec<RegisterDefinition>> {
    let file = std::fs::File::open(path).io_error(&format!("open {}", path.display()))?;
    let registers = parse_registers(file, unit_id)?;
    info!(
        path = %path.display(),
        count = registers.len(),
        "Register table loaded"
    );
    Ok(registers)
}
