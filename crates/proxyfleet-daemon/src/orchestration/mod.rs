//! Node registry and fleet orchestration.

mod manager;
mod registry;

pub use manager::{AccountOp, ManagerError, Orchestrator};
pub use registry::{NodeEntry, NodeRegistry};
