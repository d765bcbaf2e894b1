//! Proxyfleet Daemon Library
//!
//! Core functionality for the proxyfleet daemon:
//! - Local proxy-engine process supervision
//! - Authenticated RPC channels to remote nodes
//! - Fleet orchestration (user and config convergence)
//! - Periodic health monitoring and traffic accounting
//! - SQLite storage for nodes, users and usage

pub mod engine;
pub mod monitor;
pub mod node;
pub mod orchestration;
pub mod storage;
