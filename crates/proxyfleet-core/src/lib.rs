//! proxyfleet Core Library
//!
//! Shared functionality for proxyfleet components:
//! - Engine configuration parsing, resolution and runtime-config merging
//! - User/account model and per-protocol account synthesis
//! - Shared database helpers and error types

pub mod db;
pub mod engine;
pub mod tracing_init;
pub mod user;

pub use engine::{ConfigError, ConfigResolver, EngineConfig, InboundProfile};
pub use user::{Protocol, ProxySettings, User, UserStatus};
