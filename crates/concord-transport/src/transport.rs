//! Inter-context transport contract

use async_trait::async_trait;

use concord_core::{ConcordError, ConcordResult, ContextId, Envelope};

/// Outcome of a best-effort broadcast
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Destinations the envelope was handed to
    pub delivered: Vec<ContextId>,
    /// One error per destination that could not be reached
    pub failed: Vec<ConcordError>,
}

impl BroadcastReport {
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Send-to-one / broadcast-to-all over the host's inter-context channel
///
/// Delivery is at-most-once and FIFO only per (sender, receiver) pair.
/// Receiving is done through the receiver handed out when a context
/// attaches to the channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Context this transport sends as
    fn local_context(&self) -> &ContextId;

    /// Send to a single context
    async fn send(&self, to: &ContextId, envelope: &Envelope) -> ConcordResult<()>;

    /// Send to every known context except `exclude` (and except self).
    /// Never fails as a whole; per-destination failures land in the report.
    async fn broadcast(&self, envelope: &Envelope, exclude: &ContextId) -> BroadcastReport;
}
