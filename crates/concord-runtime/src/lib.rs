//! Concord Runtime - per-context engine
//!
//! This crate wires the state layer to the outside world:
//! - Context synchronizer (UPDATE/QUERY/SYNC over the transport)
//! - Realtime channel manager (reconnecting server channel)
//! - Engine builder and lifecycle
//! - Configuration and logging setup

pub mod config;
pub mod logging;
pub mod sync;
pub mod realtime;
pub mod engine;

pub use config::*;
pub use logging::*;
pub use sync::*;
pub use realtime::*;
pub use engine::*;
