//! Storage layer: database handle, models, and queries.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::{NodeRecord, NodeStatus, UserRow};
pub use queries::{LOCAL_NODE_ID, NewNode};
