//! proxyfleet Protocol Buffers
//!
//! Generated protobuf code for the proxyfleet control-plane gRPC API.
//!
//! This crate contains:
//! - `NodeControlService` for driving a remote node's engine lifecycle
//! - `EngineControlService` for account management and traffic stats

#![allow(clippy::derive_partial_eq_without_eq)]

/// proxyfleet v1 API definitions.
///
/// All generated types and services are included here.
pub mod v1 {
    tonic::include_proto!("proxyfleet.v1");
}

// Re-export v1 as the default API version for convenience
pub use v1::*;

// Re-export prost_types for downstream crates that need timestamp conversion
pub use prost_types;
