//! State-change events
//!
//! Events are what the subscriber registry fans out: committed section
//! changes, realtime channel transitions, and realtime messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConnectionState, ContextId, LogicalTime, SectionKey};

/// Where a committed section change came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeSource {
    /// `mutate` in this context
    Local,
    /// Envelope from another context
    Remote(ContextId),
    /// Realtime channel
    Realtime,
    /// Loaded from persistence at startup
    Restored,
}

/// Message on the realtime channel
/// Wire shape: `{ type, data, timestamp, originId? }`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
}

impl RealtimeMessage {
    pub fn new(kind: impl Into<String>, data: Value, timestamp: u64) -> Self {
        RealtimeMessage {
            kind: kind.into(),
            data,
            timestamp,
            origin_id: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin_id = Some(origin.into());
        self
    }
}

/// Notification delivered to subscribers
#[derive(Clone, Debug, PartialEq)]
pub enum StateEvent {
    SectionChanged {
        section: SectionKey,
        version: u64,
        timestamp: LogicalTime,
        source: ChangeSource,
    },
    ConnectionChanged(ConnectionState),
    Realtime(RealtimeMessage),
}

impl StateEvent {
    /// Section affected, if this is a section change
    pub fn section(&self) -> Option<SectionKey> {
        match self {
            StateEvent::SectionChanged { section, .. } => Some(*section),
            _ => None,
        }
    }
}
