//! Engine configuration domain.
//!
//! The engine (the external proxy-processing program) is driven by a JSON
//! configuration document. This module parses and validates that document,
//! resolves per-inbound connection metadata, injects the control-plane
//! inbound, and merges the live user set into a runtime config.

mod config;
mod runtime;

pub use config::{
    CONTROL_API_TAG, ConfigError, ConfigResolver, EngineConfig, InboundProfile, TlsMode,
};
pub use runtime::synthesize_account;
