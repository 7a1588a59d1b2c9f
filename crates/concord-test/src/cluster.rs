//! Multi-context cluster harness
//!
//! Builds one engine per context name over a shared in-process hub, each
//! with its own memory storage, and starts their loops.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use concord_core::{ConcordError, ConcordResult, ContextId, SectionKey, StateSnapshot};
use concord_runtime::{Engine, EngineConfig};
use concord_transport::{LocalHub, MemoryStorage, Transport};

use crate::{LossConfig, LossyTransport};

/// One context of a cluster
pub struct ClusterNode {
    pub engine: Arc<Engine>,
    pub storage: Arc<MemoryStorage>,
    /// Set when the cluster was built with faulty links
    pub link: Option<Arc<LossyTransport>>,
    /// Fault settings the link was built with, reused on restart
    pub loss: Option<LossConfig>,
}

/// N engines sharing one hub
pub struct Cluster {
    hub: LocalHub,
    config: EngineConfig,
    nodes: BTreeMap<ContextId, ClusterNode>,
}

impl Cluster {
    /// Clean links, default configuration
    pub async fn new(names: &[&str]) -> ConcordResult<Self> {
        Self::with_config(names, EngineConfig::default(), None).await
    }

    pub async fn with_config(
        names: &[&str],
        config: EngineConfig,
        links: Option<LossConfig>,
    ) -> ConcordResult<Self> {
        let mut cluster = Cluster {
            hub: LocalHub::new(),
            config,
            nodes: BTreeMap::new(),
        };
        for name in names {
            let storage = Arc::new(MemoryStorage::new());
            cluster.spawn(name, storage, links.clone()).await?;
        }
        Ok(cluster)
    }

    /// Build and start a node; replaces any node with the same name
    pub async fn spawn(
        &mut self,
        name: &str,
        storage: Arc<MemoryStorage>,
        links: Option<LossConfig>,
    ) -> ConcordResult<&ClusterNode> {
        let context = ContextId::new(name);
        let (hub_transport, receiver) = self.hub.attach(context.clone());

        let link = links
            .clone()
            .map(|config| Arc::new(LossyTransport::new(hub_transport.clone(), config)));
        let transport: Arc<dyn Transport> = match &link {
            Some(link) => Arc::clone(link) as Arc<dyn Transport>,
            None => Arc::new(hub_transport),
        };

        let engine = Engine::builder(context.clone())
            .transport(transport)
            .storage(Arc::clone(&storage) as _)
            .config(self.config.clone())
            .build()
            .await?;
        engine.start(receiver);

        self.nodes.insert(
            context.clone(),
            ClusterNode {
                engine: Arc::new(engine),
                storage,
                link,
                loss: links,
            },
        );
        self.nodes
            .get(&context)
            .ok_or_else(|| ConcordError::Config(format!("node {} vanished", context)))
    }

    /// Stop a node and start a fresh engine on the same storage and link
    /// settings
    pub async fn restart(&mut self, name: &str) -> ConcordResult<&ClusterNode> {
        let context = ContextId::new(name);
        let node = self
            .nodes
            .remove(&context)
            .ok_or_else(|| ConcordError::Config(format!("no node {}", name)))?;
        node.engine.shutdown().await?;
        self.spawn(name, node.storage, node.loss).await
    }

    pub fn hub(&self) -> &LocalHub {
        &self.hub
    }

    pub fn node(&self, name: &str) -> Option<&ClusterNode> {
        self.nodes.get(&ContextId::new(name))
    }

    pub fn engine(&self, name: &str) -> Option<&Arc<Engine>> {
        self.node(name).map(|node| &node.engine)
    }

    /// Make a context unreachable (surface closed)
    pub fn detach(&self, name: &str) {
        self.hub.detach(&ContextId::new(name));
    }

    pub fn snapshots(&self) -> Vec<(ContextId, StateSnapshot)> {
        self.nodes
            .iter()
            .map(|(context, node)| (context.clone(), node.engine.snapshot()))
            .collect()
    }

    /// Every context holds the same value and timestamp for `section`
    pub fn converged_on(&self, section: SectionKey) -> bool {
        let mut states = self
            .nodes
            .values()
            .map(|node| node.engine.store().section(section));
        match states.next() {
            Some(first) => states.all(|state| state == first),
            None => true,
        }
    }

    /// Every section converged
    pub fn converged(&self) -> bool {
        SectionKey::ALL
            .into_iter()
            .all(|section| self.converged_on(section))
    }

    pub async fn shutdown(self) -> ConcordResult<()> {
        for node in self.nodes.into_values() {
            node.engine.shutdown().await?;
        }
        Ok(())
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
