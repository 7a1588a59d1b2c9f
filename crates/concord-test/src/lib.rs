//! Concord Test Harness - multi-context scenarios
//!
//! This crate provides:
//! - Lossy and duplicating links between contexts
//! - A cluster harness (one engine per context over a shared hub)
//! - A scripted realtime connector
//! - End-to-end scenarios

pub mod lossy;
pub mod cluster;
pub mod scripted;
pub mod scenarios;

pub use lossy::*;
pub use cluster::*;
pub use scripted::*;
