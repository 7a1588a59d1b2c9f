//! Concord State - canonical state of one context
//!
//! This crate provides:
//! - The subscriber registry (isolated listener fan-out)
//! - Section validation hooks and common patches
//! - The state store (local mutation, last-writer-wins remote apply)
//! - The persistence adapter (snapshot load/save/flush)
//! - The optimistic update tracker (tentative overlays)

pub mod registry;
pub mod validate;
pub mod patch;
pub mod store;
pub mod persistence;
pub mod optimistic;

pub use registry::*;
pub use validate::*;
pub use store::*;
pub use persistence::*;
pub use optimistic::*;
