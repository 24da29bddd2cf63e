//! Scout protocol core
//!
//! Diagnostic core for substation and plant devices: IEC 61850 model
//! discovery and select-before-operate control, and Modbus TCP register
//! reads and writes packed into as few requests as possible.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  ScoutConfig    │───►│ create_device   │───►│  DeviceManager  │
//! │  (YAML + env)   │    │ (IEC / Modbus)  │    │ (worker/device) │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!                                                        │
//!                                                        ▼
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │   WatchList     │───►│   UpdateHub     │◄───│  UpdateSlot     │
//! │ (refresh/poll)  │    │ (fan-out/feed)  │    │ (one per device)│
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//! ```
//!
//! - **`core::iec61850`**: MMS client seam, reference resolution, discovery,
//!   SBO control engine, vendor profiles and an in-memory simulated IED
//! - **`core::modbus`**: register codec, block packer, CSV import, transport
//! - **`core::model`**: signals, node tree, update slot
//! - **`core::channels`**: protocol dispatch, device manager, update hub, watch list

pub mod config;
pub mod core;
pub mod error;

pub use config::{DeviceConfig, ScoutConfig};
pub use crate::core::channels::{create_device, DeviceManager, DeviceProtocol, UpdateHub, WatchList};
pub use error::{ControlError, Result, ScoutSrvError};
