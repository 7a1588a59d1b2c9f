//! Scripted realtime connector
//!
//! Each connect attempt consumes the next step of a script. Accepted
//! connects hand the far end of an in-memory link to the test.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use concord_core::{ConcordError, ConcordResult};
use concord_runtime::{LinkPeer, RealtimeConnector, RealtimeLink};

/// Outcome of one connect attempt
#[derive(Clone, Debug)]
pub enum ConnectStep {
    Refuse(String),
    Accept,
}

/// Connector driven by a fixed script; refuses once the script runs out
pub struct ScriptedConnector {
    script: Mutex<VecDeque<ConnectStep>>,
    peers: mpsc::UnboundedSender<LinkPeer>,
    attempts: Mutex<Vec<Instant>>,
}

impl ScriptedConnector {
    /// Connector plus the stream of accepted links' far ends
    pub fn new(
        steps: impl IntoIterator<Item = ConnectStep>,
    ) -> (Self, mpsc::UnboundedReceiver<LinkPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ScriptedConnector {
                script: Mutex::new(steps.into_iter().collect()),
                peers: tx,
                attempts: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    /// Connector that refuses every attempt
    pub fn refusing() -> Self {
        Self::new([]).0
    }

    pub fn push(&self, step: ConnectStep) {
        self.script.lock().push_back(step);
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Time between consecutive attempts
    pub fn attempt_gaps(&self) -> Vec<Duration> {
        self.attempts
            .lock()
            .windows(2)
            .map(|w| w[1] - w[0])
            .collect()
    }
}

#[async_trait]
impl RealtimeConnector for ScriptedConnector {
    async fn connect(&self) -> ConcordResult<RealtimeLink> {
        self.attempts.lock().push(Instant::now());
        let step = self.script.lock().pop_front();
        match step {
            Some(ConnectStep::Accept) => {
                let (link, peer) = RealtimeLink::pair(32);
                self.peers
                    .send(peer)
                    .map_err(|_| ConcordError::Connection("test dropped the peer stream".into()))?;
                Ok(link)
            }
            Some(ConnectStep::Refuse(reason)) => Err(ConcordError::Connection(reason)),
            None => Err(ConcordError::Connection("script exhausted".into())),
        }
    }
}
