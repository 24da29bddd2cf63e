//! Protocol-neutral data model: signals, the node tree and the update slot

pub mod node;
pub mod signal;
pub mod update;

pub use node::{Node, NodeChild, NodeKind};
pub use signal::{Quality, ReadFailure, Signal, SignalKind, SignalType, SignalValue};
pub use update::{UpdateCallback, UpdateSlot};
