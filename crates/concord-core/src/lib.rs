//! Concord Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every Concord layer:
//! - Identifiers (ContextId, RequestId)
//! - Logical time and the per-context clock
//! - Sections, section values and state snapshots
//! - Mutation envelopes exchanged between contexts
//! - Connection states and state-change events
//! - The error taxonomy

pub mod id;
pub mod time;
pub mod state;
pub mod envelope;
pub mod connection;
pub mod event;
pub mod error;

pub use id::*;
pub use time::*;
pub use state::*;
pub use envelope::*;
pub use connection::*;
pub use event::*;
pub use error::*;
