//! Local engine supervision: child-process lifecycle and the loopback
//! control API client.

mod api;
mod process;

pub use api::{ApiError, EngineApi, StatScope, TrafficStat, parse_stat, user_id_of_email};
pub use process::{EngineError, EngineProcess, Readiness};
