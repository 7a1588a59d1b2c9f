//! Concord Wire Format
//!
//! JSON codecs for everything that leaves process memory:
//! - Per-section (de)serializers (maps as pair lists, sets as sorted lists)
//! - Envelope frames exchanged between contexts
//! - The persistence record
//! - Realtime channel messages

pub mod section;
pub mod envelope;
pub mod record;
pub mod realtime;

pub use section::*;
pub use envelope::*;
pub use record::*;
pub use realtime::*;
