//! Lossy links between contexts
//!
//! Wraps a hub transport and, per destination:
//! - Silently drops envelopes (the sender sees a successful send)
//! - Duplicates envelopes (replay)

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use concord_core::{ConcordResult, ContextId, Envelope};
use concord_transport::{BroadcastReport, HubTransport, Transport};

/// Link fault configuration
#[derive(Clone, Debug)]
pub struct LossConfig {
    /// Drop probability (0.0 - 1.0)
    pub loss_rate: f64,
    /// Duplicate probability (0.0 - 1.0)
    pub duplicate_prob: f64,
    /// RNG seed, for reproducible runs
    pub seed: u64,
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig {
            loss_rate: 0.0,
            duplicate_prob: 0.0,
            seed: 42,
        }
    }
}

impl LossConfig {
    /// Every envelope delivered twice
    pub fn duplicating() -> Self {
        LossConfig {
            duplicate_prob: 1.0,
            ..Default::default()
        }
    }

    /// Every envelope dropped
    pub fn blackhole() -> Self {
        LossConfig {
            loss_rate: 1.0,
            ..Default::default()
        }
    }
}

/// Link fault counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LossStats {
    pub dropped: u64,
    pub duplicated: u64,
}

enum Fate {
    Drop,
    Deliver,
    Duplicate,
}

/// Hub transport with injected loss and duplication
pub struct LossyTransport {
    inner: HubTransport,
    config: Mutex<LossConfig>,
    rng: Mutex<StdRng>,
    dropped: AtomicU64,
    duplicated: AtomicU64,
}

impl LossyTransport {
    pub fn new(inner: HubTransport, config: LossConfig) -> Self {
        LossyTransport {
            inner,
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
            config: Mutex::new(config),
            dropped: AtomicU64::new(0),
            duplicated: AtomicU64::new(0),
        }
    }

    /// Change the drop probability on the fly
    pub fn set_loss_rate(&self, rate: f64) {
        self.config.lock().loss_rate = rate.clamp(0.0, 1.0);
    }

    pub fn set_duplicate_prob(&self, prob: f64) {
        self.config.lock().duplicate_prob = prob.clamp(0.0, 1.0);
    }

    pub fn stats(&self) -> LossStats {
        LossStats {
            dropped: self.dropped.load(Ordering::Relaxed),
            duplicated: self.duplicated.load(Ordering::Relaxed),
        }
    }

    fn fate(&self) -> Fate {
        let config = self.config.lock().clone();
        let mut rng = self.rng.lock();
        if config.loss_rate > 0.0 && rng.gen_bool(config.loss_rate) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            Fate::Drop
        } else if config.duplicate_prob > 0.0 && rng.gen_bool(config.duplicate_prob) {
            self.duplicated.fetch_add(1, Ordering::Relaxed);
            Fate::Duplicate
        } else {
            Fate::Deliver
        }
    }
}

#[async_trait]
impl Transport for LossyTransport {
    fn local_context(&self) -> &ContextId {
        self.inner.local_context()
    }

    async fn send(&self, to: &ContextId, envelope: &Envelope) -> ConcordResult<()> {
        match self.fate() {
            Fate::Drop => Ok(()),
            Fate::Deliver => self.inner.send(to, envelope).await,
            Fate::Duplicate => {
                self.inner.send(to, envelope).await?;
                self.inner.send(to, envelope).await
            }
        }
    }

    async fn broadcast(&self, envelope: &Envelope, exclude: &ContextId) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for to in self.inner.hub().contexts() {
            if &to == exclude || &to == self.local_context() {
                continue;
            }
            match self.send(&to, envelope).await {
                Ok(()) => report.delivered.push(to),
                Err(e) => report.failed.push(e),
            }
        }
        report
    }
}
