//! In-process hub transport
//!
//! Every context attaches to a shared hub and gets an unbounded frame
//! queue. Frames are JSON-encoded envelopes, so contexts share nothing
//! but strings, the same as across a real process boundary.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use concord_core::{ConcordError, ConcordResult, ContextId, Envelope};
use concord_wire::{decode_envelope, encode_envelope};

use crate::{BroadcastReport, Transport};

/// Frame queue sender
pub type FrameSender = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct HubInner {
    /// Every context that ever attached
    known: BTreeSet<ContextId>,
    /// Contexts currently reachable
    routes: HashMap<ContextId, FrameSender>,
}

/// Shared inter-context channel
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<RwLock<HubInner>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a context; re-attaching replaces its previous queue
    pub fn attach(&self, context: impl Into<ContextId>) -> (HubTransport, EnvelopeReceiver) {
        let context = context.into();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.inner.write();
            inner.known.insert(context.clone());
            inner.routes.insert(context.clone(), tx);
        }
        tracing::debug!(context = %context, "context attached to hub");

        (
            HubTransport {
                hub: self.clone(),
                local: context.clone(),
            },
            EnvelopeReceiver {
                context,
                frames: rx,
            },
        )
    }

    /// Make a context unreachable while keeping it known (tab closed, surface gone)
    pub fn detach(&self, context: &ContextId) {
        self.inner.write().routes.remove(context);
        tracing::debug!(context = %context, "context detached from hub");
    }

    /// Known contexts, in order
    pub fn contexts(&self) -> Vec<ContextId> {
        self.inner.read().known.iter().cloned().collect()
    }

    pub fn is_reachable(&self, context: &ContextId) -> bool {
        self.inner
            .read()
            .routes
            .get(context)
            .is_some_and(|tx| !tx.is_closed())
    }

    fn deliver(&self, to: &ContextId, frame: String) -> ConcordResult<()> {
        let inner = self.inner.read();
        let tx = inner
            .routes
            .get(to)
            .ok_or_else(|| ConcordError::transport(to, "unreachable"))?;
        tx.send(frame)
            .map_err(|_| ConcordError::transport(to, "receiver dropped"))
    }
}

/// One context's handle on the hub
#[derive(Clone)]
pub struct HubTransport {
    hub: LocalHub,
    local: ContextId,
}

impl HubTransport {
    pub fn hub(&self) -> &LocalHub {
        &self.hub
    }
}

#[async_trait]
impl Transport for HubTransport {
    fn local_context(&self) -> &ContextId {
        &self.local
    }

    async fn send(&self, to: &ContextId, envelope: &Envelope) -> ConcordResult<()> {
        let frame = encode_envelope(envelope)?;
        self.hub.deliver(to, frame)
    }

    async fn broadcast(&self, envelope: &Envelope, exclude: &ContextId) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let frame = match encode_envelope(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode envelope for broadcast");
                report.failed.push(e);
                return report;
            }
        };

        for to in self.hub.contexts() {
            if &to == exclude || to == self.local {
                continue;
            }
            match self.hub.deliver(&to, frame.clone()) {
                Ok(()) => report.delivered.push(to),
                Err(e) => {
                    tracing::debug!(destination = %to, error = %e, "broadcast destination skipped");
                    report.failed.push(e);
                }
            }
        }
        report
    }
}

/// Receiving end of a context's frame queue
pub struct EnvelopeReceiver {
    context: ContextId,
    frames: mpsc::UnboundedReceiver<String>,
}

impl EnvelopeReceiver {
    pub fn context(&self) -> &ContextId {
        &self.context
    }

    /// Next well-formed envelope; malformed frames are logged and dropped.
    /// Returns `None` once the hub side is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let frame = self.frames.recv().await?;
            match decode_envelope(&frame) {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    tracing::warn!(context = %self.context, error = %e, "dropping malformed frame");
                }
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<Envelope> {
        while let Ok(frame) = self.frames.try_recv() {
            match decode_envelope(&frame) {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    tracing::warn!(context = %self.context, error = %e, "dropping malformed frame");
                }
            }
        }
        None
    }
}
