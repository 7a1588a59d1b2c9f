//! Error types for Concord

use std::time::Duration;

use thiserror::Error;

use crate::{ContextId, RequestId, SectionKey};

/// Core Concord errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConcordError {
    // Local mutation errors (never broadcast)
    #[error("Validation failed for section {section}: {reason}")]
    Validation { section: SectionKey, reason: String },

    #[error("Unknown section: {0}")]
    UnknownSection(String),

    // Durability errors (logged, retried on next flush)
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Delivery errors (one destination; never fails a broadcast)
    #[error("Transport error to {destination}: {reason}")]
    Transport { destination: ContextId, reason: String },

    // Realtime channel errors (drive the reconnect state machine)
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Realtime channel failed after {attempts} attempts")]
    ChannelFailed { attempts: u32 },

    // Query errors
    #[error("Query {request_id} timed out after {after:?}")]
    Timeout { request_id: RequestId, after: Duration },

    // Wire errors
    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ConcordError {
    pub fn validation(section: SectionKey, reason: impl Into<String>) -> Self {
        ConcordError::Validation {
            section,
            reason: reason.into(),
        }
    }

    pub fn transport(destination: &ContextId, reason: impl Into<String>) -> Self {
        ConcordError::Transport {
            destination: destination.clone(),
            reason: reason.into(),
        }
    }

    /// Errors the caller must see (everything else is recovered locally)
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            ConcordError::Validation { .. }
                | ConcordError::UnknownSection(_)
                | ConcordError::Timeout { .. }
                | ConcordError::ChannelFailed { .. }
        )
    }
}

impl From<serde_json::Error> for ConcordError {
    fn from(e: serde_json::Error) -> Self {
        ConcordError::Codec(e.to_string())
    }
}

/// Result type for Concord operations
pub type ConcordResult<T> = Result<T, ConcordError>;
