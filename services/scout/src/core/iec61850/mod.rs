//! IEC 61850 side: MMS client seam, reference resolution, discovery,
//! select-before-operate control and the device adapter

pub mod adapter;
pub mod client;
pub mod control;
pub mod discovery;
pub mod reference;
pub mod sbo;
pub mod simulator;
pub mod vendor;

pub use adapter::{Iec61850Device, Iec61850Settings};
pub use client::{Fc, IedError, IedErrorCode, MmsClient, MmsValue};
pub use control::{CommandOptions, ControlModel, ControlState, OrCat, Originator};
pub use discovery::{DiscoveryEngine, DiscoveryReport, DiscoverySettings};
pub use sbo::{CommandOutcome, ControlEngine, ControlSettings};
pub use simulator::SimulatedIed;
pub use vendor::VendorProfile;
