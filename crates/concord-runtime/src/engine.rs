//! Engine - one context's wiring of store, persistence, sync and realtime
//!
//! Built explicitly per context with injected transport and storage:
//!
//! ```ignore
//! let hub = LocalHub::new();
//! let (transport, receiver) = hub.attach("background");
//! let engine = Engine::builder("background")
//!     .transport(Arc::new(transport))
//!     .storage(Arc::new(MemoryStorage::new()))
//!     .build()
//!     .await?;
//! engine.start(receiver);
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use concord_core::{
    ConcordError, ConcordResult, ContextId, SectionKey, SectionState, SectionValue, StateEvent,
    StateSnapshot,
};
use concord_state::{
    FlushOutcome, OptimisticTracker, PersistenceAdapter, StateStore, SubscriptionToken,
    ValidatorSet,
};
use concord_transport::{EnvelopeReceiver, Storage, Transport};

use crate::{
    BroadcastObserver, ContextSynchronizer, EngineConfig, RealtimeChannel, RealtimeConnector,
    WsConnector,
};

/// Builder for [`Engine`]
pub struct EngineBuilder {
    context: ContextId,
    transport: Option<Arc<dyn Transport>>,
    storage: Option<Arc<dyn Storage>>,
    config: EngineConfig,
    validators: ValidatorSet,
    connector: Option<Arc<dyn RealtimeConnector>>,
    observer: Option<Arc<dyn BroadcastObserver>>,
}

impl EngineBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn validators(mut self, validators: ValidatorSet) -> Self {
        self.validators = validators;
        self
    }

    /// Realtime connector; overrides `config.realtime.url`
    pub fn realtime_connector(mut self, connector: Arc<dyn RealtimeConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn broadcast_observer(mut self, observer: Arc<dyn BroadcastObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Load persisted state and assemble the engine
    ///
    /// A persisted record that cannot be read or decoded is logged and
    /// replaced by defaults.
    pub async fn build(self) -> ConcordResult<Engine> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| ConcordError::Config("engine needs a transport".into()))?;
        let storage = self
            .storage
            .ok_or_else(|| ConcordError::Config("engine needs a storage backend".into()))?;
        if transport.local_context() != &self.context {
            return Err(ConcordError::Config(format!(
                "transport belongs to {}, engine is {}",
                transport.local_context(),
                self.context
            )));
        }

        let persistence = Arc::new(PersistenceAdapter::new(storage, self.config.storage_key.clone()));
        let snapshot = match persistence.load().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => StateSnapshot::new(),
            Err(e) => {
                tracing::warn!(
                    context = %self.context,
                    key = %persistence.key(),
                    error = %e,
                    "persisted state unreadable; starting from defaults"
                );
                StateSnapshot::new()
            }
        };
        tracing::info!(
            context = %self.context,
            version = snapshot.version,
            "engine state loaded"
        );

        let store = Arc::new(StateStore::new(
            self.context.clone(),
            snapshot,
            self.config.logical_clock,
            self.validators,
        ));
        let sync = Arc::new(ContextSynchronizer::new(Arc::clone(&store), transport));
        if let Some(observer) = self.observer {
            sync.set_observer(observer);
        }

        let cancel = CancellationToken::new();
        let connector = self.connector.or_else(|| {
            self.config.realtime.url.as_ref().map(|url| {
                Arc::new(WsConnector::new(url.clone(), self.config.realtime.outbound_buffer))
                    as Arc<dyn RealtimeConnector>
            })
        });
        let realtime = connector.map(|connector| {
            Arc::new(RealtimeChannel::new(
                self.config.realtime.clone(),
                Arc::clone(&store),
                connector,
                cancel.child_token(),
            ))
        });

        Ok(Engine {
            context: self.context,
            optimistic: OptimisticTracker::new(Arc::clone(&store)),
            store,
            persistence,
            sync,
            realtime,
            config: self.config,
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// One context's replication engine
pub struct Engine {
    context: ContextId,
    config: EngineConfig,
    store: Arc<StateStore>,
    persistence: Arc<PersistenceAdapter>,
    sync: Arc<ContextSynchronizer>,
    realtime: Option<Arc<RealtimeChannel>>,
    optimistic: OptimisticTracker,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder(context: impl Into<ContextId>) -> EngineBuilder {
        EngineBuilder {
            context: context.into(),
            transport: None,
            storage: None,
            config: EngineConfig::default(),
            validators: ValidatorSet::standard(),
            connector: None,
            observer: None,
        }
    }

    pub fn context(&self) -> &ContextId {
        &self.context
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn synchronizer(&self) -> &Arc<ContextSynchronizer> {
        &self.sync
    }

    pub fn realtime(&self) -> Option<&Arc<RealtimeChannel>> {
        self.realtime.as_ref()
    }

    pub fn optimistic(&self) -> &OptimisticTracker {
        &self.optimistic
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionToken
    where
        F: Fn(&StateEvent) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.store.unsubscribe(token)
    }

    /// Canonical section value
    ///
    /// Tentative optimistic patches are not merged here; read single
    /// entities through [`optimistic().view()`](OptimisticTracker::view) to
    /// see them.
    pub fn get(&self, section: SectionKey) -> SectionValue {
        self.store.get(section)
    }

    /// Canonical state of every section, without optimistic overlays
    pub fn snapshot(&self) -> StateSnapshot {
        self.store.snapshot()
    }

    /// Commit a local mutation; returns the new global version
    ///
    /// The store is updated before this returns. Persistence and broadcast
    /// run as spawned tasks and never fail the mutation.
    pub async fn mutate<P>(&self, section: SectionKey, patch: P) -> ConcordResult<u64>
    where
        P: FnOnce(&mut SectionValue) -> ConcordResult<()>,
    {
        let commit = self.store.mutate(section, patch)?;

        if let Some(realtime) = &self.realtime {
            realtime.publish_commit(&commit);
        }

        let version = commit.version;
        let sync = Arc::clone(&self.sync);
        tokio::spawn(async move {
            sync.publish(&commit).await;
        });

        let store = Arc::clone(&self.store);
        let persistence = Arc::clone(&self.persistence);
        tokio::spawn(async move {
            // Failures are logged by flush and retried on the next one
            let _ = persistence.flush(&store).await;
        });

        Ok(version)
    }

    /// Ask a peer for its copy of a section (bounded by `query_timeout`)
    pub async fn query(&self, peer: &ContextId, section: SectionKey) -> ConcordResult<SectionState> {
        self.sync.query(peer, section, self.config.query_timeout).await
    }

    /// Pull every section from a peer (drift repair after restart)
    pub async fn reconcile_with(&self, peer: &ContextId) -> ConcordResult<usize> {
        self.sync.reconcile_with(peer, self.config.query_timeout).await
    }

    /// Persist now if anything is dirty
    pub async fn flush(&self) -> ConcordResult<FlushOutcome> {
        self.persistence.flush(&self.store).await
    }

    /// Spawn the receive loop, the periodic flush and the realtime driver,
    /// then announce local state to the other contexts
    pub fn start(&self, receiver: EnvelopeReceiver) {
        let mut tasks = self.tasks.lock();

        let sync = Arc::clone(&self.sync);
        let cancel = self.cancel.child_token();
        tasks.push(tokio::spawn(async move {
            sync.run(receiver, cancel).await;
        }));

        tasks.push(tokio::spawn(flush_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.persistence),
            self.config.flush_interval,
            self.cancel.child_token(),
        )));

        if let Some(handle) = self.realtime.as_ref().and_then(|r| r.start()) {
            tasks.push(handle);
        }

        let sync = Arc::clone(&self.sync);
        tasks.push(tokio::spawn(async move {
            sync.announce().await;
        }));

        tracing::info!(context = %self.context, "engine started");
    }

    /// Run until `signal` completes, then shut down
    pub async fn run_until<F: Future>(&self, signal: F) -> ConcordResult<()> {
        signal.await;
        self.shutdown().await
    }

    /// Stop every loop and flush pending state
    pub async fn shutdown(&self) -> ConcordResult<()> {
        self.cancel.cancel();
        if let Some(realtime) = &self.realtime {
            realtime.shutdown();
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(context = %self.context, error = %e, "engine task ended abnormally");
            }
        }

        let outcome = self.flush().await?;
        tracing::info!(context = %self.context, ?outcome, "engine stopped");
        Ok(())
    }
}

async fn flush_loop(
    store: Arc<StateStore>,
    persistence: Arc<PersistenceAdapter>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // Logged inside; dirty sections stay dirty for the next tick
                let _ = persistence.flush(&store).await;
            }
        }
    }
}
