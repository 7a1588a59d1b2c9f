//! Mutation envelopes
//!
//! Envelopes are the addressed, typed message units exchanged between
//! contexts. Every envelope carries its origin and a fresh tick of the
//! origin's logical clock.

use std::fmt;

use crate::{ContextId, LogicalTime, RequestId, SectionKey, SectionState, SectionValue};

/// Envelope kind (wire discriminator)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Update,
    Query,
    Sync,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Update => "UPDATE",
            EnvelopeKind::Query => "QUERY",
            EnvelopeKind::Sync => "SYNC",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "UPDATE" => Some(EnvelopeKind::Update),
            "QUERY" => Some(EnvelopeKind::Query),
            "SYNC" => Some(EnvelopeKind::Sync),
            _ => None,
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope body - one variant per kind
#[derive(Clone, Debug, PartialEq)]
pub enum EnvelopeBody {
    /// A committed local write; the whole section value
    Update {
        section: SectionKey,
        value: SectionValue,
    },
    /// Ask one context for its copy of a section
    Query {
        section: SectionKey,
        request_id: RequestId,
    },
    /// Full section snapshot, with the section's own write timestamp.
    /// Answers a query when `request_id` is set.
    Sync {
        section: SectionKey,
        state: SectionState,
        request_id: Option<RequestId>,
    },
}

/// Envelope exchanged between contexts
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Sending context
    pub origin: ContextId,
    /// Origin's logical time when the envelope was built
    pub timestamp: LogicalTime,
    pub body: EnvelopeBody,
}

impl Envelope {
    pub fn update(origin: ContextId, timestamp: LogicalTime, value: SectionValue) -> Self {
        Envelope {
            origin,
            timestamp,
            body: EnvelopeBody::Update {
                section: value.key(),
                value,
            },
        }
    }

    pub fn query(
        origin: ContextId,
        timestamp: LogicalTime,
        section: SectionKey,
        request_id: RequestId,
    ) -> Self {
        Envelope {
            origin,
            timestamp,
            body: EnvelopeBody::Query {
                section,
                request_id,
            },
        }
    }

    pub fn sync(
        origin: ContextId,
        timestamp: LogicalTime,
        state: SectionState,
        request_id: Option<RequestId>,
    ) -> Self {
        Envelope {
            origin,
            timestamp,
            body: EnvelopeBody::Sync {
                section: state.value.key(),
                state,
                request_id,
            },
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self.body {
            EnvelopeBody::Update { .. } => EnvelopeKind::Update,
            EnvelopeBody::Query { .. } => EnvelopeKind::Query,
            EnvelopeBody::Sync { .. } => EnvelopeKind::Sync,
        }
    }

    pub fn section(&self) -> SectionKey {
        match &self.body {
            EnvelopeBody::Update { section, .. }
            | EnvelopeBody::Query { section, .. }
            | EnvelopeBody::Sync { section, .. } => *section,
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match &self.body {
            EnvelopeBody::Update { .. } => None,
            EnvelopeBody::Query { request_id, .. } => Some(request_id),
            EnvelopeBody::Sync { request_id, .. } => request_id.as_ref(),
        }
    }
}
