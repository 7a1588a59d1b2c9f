//! Concord Transport Layer - inter-context channel and durable storage
//!
//! This crate provides:
//! - The transport contract (send-to-one, broadcast-to-all)
//! - An in-process hub transport with per-context frame queues
//! - The storage contract (read/write by key)
//! - Memory and file storage backends

pub mod transport;
pub mod hub;
pub mod storage;

pub use transport::*;
pub use hub::*;
pub use storage::*;
