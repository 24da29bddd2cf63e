//! Device orchestration: protocol dispatch, per-device workers, update
//! fan-out, the watch list and the register gateway

pub mod factory;
pub mod gateway;
pub mod manager;
pub mod protocol;
pub mod updates;
pub mod watch;

pub use factory::create_device;
pub use gateway::{GatewayMapping, ProtocolGateway, RegisterTable};
pub use manager::DeviceManager;
pub use protocol::{CommandReport, DeviceProtocol, ProtocolKind};
pub use updates::{Observer, ObserverId, SignalUpdate, UpdateHub};
pub use watch::{RefreshSummary, WatchEntry, WatchList, MIN_POLL_INTERVAL};
