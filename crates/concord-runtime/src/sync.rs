//! Context Synchronizer - cross-context propagation of committed writes
//!
//! Outbound: every committed local mutation is wrapped as an UPDATE and
//! broadcast to all other contexts. Delivery is best effort; a failed
//! destination is logged and counted, never retried.
//!
//! Inbound: UPDATE and SYNC are applied with last-writer-wins on the
//! section timestamp. QUERY is answered with a SYNC carrying the same
//! request id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use concord_core::{
    ChangeSource, ConcordError, ConcordResult, ContextId, Envelope, EnvelopeBody, RequestId,
    SectionKey, SectionState,
};
use concord_state::{Commit, RemoteOutcome, StateStore};
use concord_transport::{BroadcastReport, EnvelopeReceiver, Transport};

/// How many answered query ids are remembered for de-duplication
const ANSWERED_HISTORY: usize = 1024;

/// Observer of broadcast outcomes (failed-destination counts included)
pub trait BroadcastObserver: Send + Sync {
    fn on_broadcast(&self, section: SectionKey, report: &BroadcastReport);
}

impl<F> BroadcastObserver for F
where
    F: Fn(SectionKey, &BroadcastReport) + Send + Sync,
{
    fn on_broadcast(&self, section: SectionKey, report: &BroadcastReport) {
        self(section, report)
    }
}

/// Synchronizer counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub published: u64,
    pub delivered: u64,
    pub failed_destinations: u64,
    pub applied: u64,
    pub stale: u64,
    pub rejected: u64,
    pub queries_answered: u64,
    pub queries_resolved: u64,
    pub queries_timed_out: u64,
}

/// What `handle` did with an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handled {
    /// Carried section replaced the local one
    Applied,
    /// Carried section was not newer
    Stale,
    /// Query answered with a SYNC
    Answered,
    /// Query id already answered
    Duplicate,
    /// Sent by this context
    Ignored,
}

#[derive(Default)]
struct AnsweredQueries {
    ids: HashSet<RequestId>,
    order: VecDeque<RequestId>,
}

impl AnsweredQueries {
    /// Record an id; `false` if it was already answered
    fn insert(&mut self, id: &RequestId) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id.clone());
        if self.order.len() > ANSWERED_HISTORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

type PendingMap = Mutex<HashMap<RequestId, oneshot::Sender<SectionState>>>;

/// Outstanding query; forgets its waiter on drop
struct PendingQuery<'a> {
    pending: &'a PendingMap,
    request_id: RequestId,
}

impl Drop for PendingQuery<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.request_id);
    }
}

/// Propagates one context's writes and applies everyone else's
pub struct ContextSynchronizer {
    store: Arc<StateStore>,
    transport: Arc<dyn Transport>,
    observer: RwLock<Option<Arc<dyn BroadcastObserver>>>,
    pending: PendingMap,
    answered: Mutex<AnsweredQueries>,
    next_request: AtomicU64,
    stats: Mutex<SyncStats>,
}

impl ContextSynchronizer {
    pub fn new(store: Arc<StateStore>, transport: Arc<dyn Transport>) -> Self {
        ContextSynchronizer {
            store,
            transport,
            observer: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            answered: Mutex::new(AnsweredQueries::default()),
            next_request: AtomicU64::new(1),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    pub fn local_context(&self) -> &ContextId {
        self.transport.local_context()
    }

    /// Install the broadcast observer (replaces any previous one)
    pub fn set_observer(&self, observer: Arc<dyn BroadcastObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.lock().clone()
    }

    /// Queries waiting for a reply
    pub fn pending_queries(&self) -> usize {
        self.pending.lock().len()
    }

    /// Broadcast a committed write to every other context
    pub async fn publish(&self, commit: &Commit) -> BroadcastReport {
        let local = self.local_context().clone();
        let envelope = Envelope::update(local.clone(), commit.timestamp, commit.value.clone());
        let report = self.transport.broadcast(&envelope, &local).await;
        self.record_broadcast(commit.section, &report);
        report
    }

    /// Broadcast a SYNC of every section (after restart or reconnect)
    ///
    /// Returns the total number of failed destinations.
    pub async fn announce(&self) -> usize {
        let local = self.local_context().clone();
        let mut failed = 0;
        for section in SectionKey::ALL {
            let envelope = Envelope::sync(
                local.clone(),
                self.store.next_timestamp(),
                self.store.section(section),
                None,
            );
            let report = self.transport.broadcast(&envelope, &local).await;
            failed += report.failed_count();
            self.record_broadcast(section, &report);
        }
        failed
    }

    fn record_broadcast(&self, section: SectionKey, report: &BroadcastReport) {
        {
            let mut stats = self.stats.lock();
            stats.published += 1;
            stats.delivered += report.delivered_count() as u64;
            stats.failed_destinations += report.failed_count() as u64;
        }

        if !report.is_complete() {
            for error in &report.failed {
                tracing::warn!(section = %section, error = %error, "broadcast destination failed");
            }
            tracing::warn!(
                section = %section,
                failed = report.failed_count(),
                delivered = report.delivered_count(),
                "broadcast incomplete"
            );
        }

        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_broadcast(section, report);
        }
    }

    /// Ask one peer for its copy of a section
    ///
    /// Resolves when the matching SYNC arrives (through [`handle`](Self::handle),
    /// so the receive loop must be running) or fails with a timeout.
    pub async fn query(
        &self,
        peer: &ContextId,
        section: SectionKey,
        timeout: Duration,
    ) -> ConcordResult<SectionState> {
        let local = self.local_context().clone();
        let request_id =
            RequestId::for_origin(&local, self.next_request.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);
        // Removes the waiter however this future ends, dropped callers included
        let _pending = PendingQuery {
            pending: &self.pending,
            request_id: request_id.clone(),
        };

        let envelope = Envelope::query(
            local,
            self.store.next_timestamp(),
            section,
            request_id.clone(),
        );
        self.transport.send(peer, &envelope).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(_)) => Err(ConcordError::ChannelClosed),
            Err(_) => {
                self.stats.lock().queries_timed_out += 1;
                tracing::debug!(
                    peer = %peer,
                    section = %section,
                    request_id = %request_id,
                    "query timed out"
                );
                Err(ConcordError::Timeout {
                    request_id,
                    after: timeout,
                })
            }
        }
    }

    /// Query every section from a peer; returns how many replies arrived
    ///
    /// Replies are applied with last-writer-wins like any other SYNC.
    pub async fn reconcile_with(&self, peer: &ContextId, timeout: Duration) -> ConcordResult<usize> {
        let mut received = 0;
        let mut last_error = None;
        for section in SectionKey::ALL {
            match self.query(peer, section, timeout).await {
                Ok(_) => received += 1,
                Err(e) => {
                    tracing::warn!(peer = %peer, section = %section, error = %e, "reconcile query failed");
                    last_error = Some(e);
                }
            }
        }
        match (received, last_error) {
            (0, Some(e)) => Err(e),
            _ => Ok(received),
        }
    }

    /// Process one inbound envelope
    pub async fn handle(&self, envelope: Envelope) -> ConcordResult<Handled> {
        if &envelope.origin == self.local_context() {
            return Ok(Handled::Ignored);
        }

        let origin = envelope.origin;
        match envelope.body {
            EnvelopeBody::Update { section, value } => {
                let incoming = SectionState::new(value, envelope.timestamp);
                self.apply(section, incoming, origin)
            }
            EnvelopeBody::Query {
                section,
                request_id,
            } => {
                if !self.answered.lock().insert(&request_id) {
                    return Ok(Handled::Duplicate);
                }
                let reply = Envelope::sync(
                    self.local_context().clone(),
                    self.store.next_timestamp(),
                    self.store.section(section),
                    Some(request_id),
                );
                self.transport.send(&origin, &reply).await?;
                self.stats.lock().queries_answered += 1;
                Ok(Handled::Answered)
            }
            EnvelopeBody::Sync {
                section,
                state,
                request_id,
            } => {
                let waiter = request_id.and_then(|id| self.pending.lock().remove(&id));
                let handled = self.apply(section, state.clone(), origin);
                if let Some(tx) = waiter {
                    // The querier may have given up already
                    if tx.send(state).is_ok() {
                        self.stats.lock().queries_resolved += 1;
                    }
                }
                handled
            }
        }
    }

    fn apply(
        &self,
        section: SectionKey,
        incoming: SectionState,
        origin: ContextId,
    ) -> ConcordResult<Handled> {
        match self
            .store
            .apply_remote(section, incoming, ChangeSource::Remote(origin))
        {
            Ok(RemoteOutcome::Applied { .. }) => {
                self.stats.lock().applied += 1;
                Ok(Handled::Applied)
            }
            Ok(RemoteOutcome::Stale { .. }) => {
                self.stats.lock().stale += 1;
                Ok(Handled::Stale)
            }
            Err(e) => {
                self.stats.lock().rejected += 1;
                Err(e)
            }
        }
    }

    /// Receive loop; stops on cancellation or when the channel closes
    pub async fn run(&self, mut receiver: EnvelopeReceiver, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = receiver.recv() => {
                    let Some(envelope) = envelope else {
                        tracing::debug!(context = %self.local_context(), "inbound channel closed");
                        break;
                    };
                    let kind = envelope.kind();
                    let origin = envelope.origin.clone();
                    if let Err(e) = self.handle(envelope).await {
                        tracing::warn!(
                            context = %self.local_context(),
                            origin = %origin,
                            kind = %kind,
                            error = %e,
                            "inbound envelope dropped"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{LogicalTime, SectionValue};
    use concord_state::patch;
    use concord_transport::LocalHub;
    use serde_json::json;

    fn context(hub: &LocalHub, name: &str) -> (Arc<ContextSynchronizer>, Arc<StateStore>, EnvelopeReceiver) {
        let (transport, receiver) = hub.attach(name);
        let store = Arc::new(StateStore::with_defaults(name));
        let sync = Arc::new(ContextSynchronizer::new(Arc::clone(&store), Arc::new(transport)));
        (sync, store, receiver)
    }

    fn prefs_update(origin: &str, theme: &str, ts: u64) -> Envelope {
        let mut value = SectionValue::default_for(SectionKey::Preferences);
        value.record_mut().unwrap().insert("theme".into(), json!(theme));
        Envelope::update(ContextId::new(origin), LogicalTime(ts), value)
    }

    fn theme(store: &StateStore) -> serde_json::Value {
        store.get(SectionKey::Preferences).record().unwrap()["theme"].clone()
    }

    #[tokio::test]
    async fn test_publish_reaches_other_contexts() {
        let hub = LocalHub::new();
        let (bg, bg_store, mut bg_rx) = context(&hub, "bg");
        let (popup, popup_store, mut popup_rx) = context(&hub, "popup");

        let commit = bg_store
            .mutate(SectionKey::Preferences, patch::merge_record(json!({"theme": "dark"})))
            .unwrap();
        let report = bg.publish(&commit).await;
        assert_eq!(report.delivered_count(), 1);
        assert!(bg_rx.try_recv().is_none());

        let envelope = popup_rx.recv().await.unwrap();
        assert_eq!(popup.handle(envelope).await.unwrap(), Handled::Applied);
        assert_eq!(theme(&popup_store), json!("dark"));
        assert_eq!(
            popup_store.section_timestamp(SectionKey::Preferences),
            commit.timestamp
        );
    }

    #[tokio::test]
    async fn test_replayed_update_is_stale() {
        let hub = LocalHub::new();
        let (popup, popup_store, _rx) = context(&hub, "popup");

        let envelope = prefs_update("bg", "dark", 10);
        assert_eq!(popup.handle(envelope.clone()).await.unwrap(), Handled::Applied);
        let version = popup_store.version();
        assert_eq!(popup.handle(envelope).await.unwrap(), Handled::Stale);
        assert_eq!(popup_store.version(), version);
    }

    #[tokio::test]
    async fn test_lww_converges_in_either_order() {
        let older = prefs_update("popup", "light", 100);
        let newer = prefs_update("tab-1", "dark", 200);

        for order in [[older.clone(), newer.clone()], [newer.clone(), older.clone()]] {
            let hub = LocalHub::new();
            let (bg, bg_store, _rx) = context(&hub, "bg");
            for envelope in order {
                bg.handle(envelope).await.unwrap();
            }
            assert_eq!(theme(&bg_store), json!("dark"));
            assert_eq!(bg_store.section_timestamp(SectionKey::Preferences), LogicalTime(200));
        }
    }

    #[tokio::test]
    async fn test_own_envelopes_ignored() {
        let hub = LocalHub::new();
        let (bg, _store, _rx) = context(&hub, "bg");
        assert_eq!(
            bg.handle(prefs_update("bg", "dark", 5)).await.unwrap(),
            Handled::Ignored
        );
    }

    #[tokio::test]
    async fn test_query_answered_once() {
        let hub = LocalHub::new();
        let (bg, bg_store, _bg_rx) = context(&hub, "bg");
        let (_popup, _popup_store, mut popup_rx) = context(&hub, "popup");
        bg_store
            .mutate(SectionKey::Settings, patch::merge_record(json!({"sync": true})))
            .unwrap();

        let query = Envelope::query(
            ContextId::new("popup"),
            LogicalTime(1),
            SectionKey::Settings,
            RequestId::from("popup:1"),
        );
        assert_eq!(bg.handle(query.clone()).await.unwrap(), Handled::Answered);
        assert_eq!(bg.handle(query).await.unwrap(), Handled::Duplicate);

        let reply = popup_rx.recv().await.unwrap();
        assert_eq!(reply.request_id(), Some(&RequestId::from("popup:1")));
        let EnvelopeBody::Sync { state, .. } = reply.body else {
            panic!("expected SYNC reply");
        };
        assert_eq!(state, bg_store.section(SectionKey::Settings));
        assert!(popup_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_query_resolves_through_run_loop() {
        let hub = LocalHub::new();
        let (bg, bg_store, bg_rx) = context(&hub, "bg");
        let (popup, popup_store, popup_rx) = context(&hub, "popup");
        bg_store
            .mutate(SectionKey::Preferences, patch::merge_record(json!({"theme": "dark"})))
            .unwrap();

        let cancel = CancellationToken::new();
        let bg_loop = {
            let (bg, cancel) = (Arc::clone(&bg), cancel.clone());
            tokio::spawn(async move { bg.run(bg_rx, cancel).await })
        };
        let popup_loop = {
            let (popup, cancel) = (Arc::clone(&popup), cancel.clone());
            tokio::spawn(async move { popup.run(popup_rx, cancel).await })
        };

        let state = popup
            .query(&ContextId::new("bg"), SectionKey::Preferences, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(state, bg_store.section(SectionKey::Preferences));
        assert_eq!(theme(&popup_store), json!("dark"));
        assert_eq!(popup.pending_queries(), 0);

        cancel.cancel();
        bg_loop.await.unwrap();
        popup_loop.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_times_out() {
        let hub = LocalHub::new();
        let (popup, _store, _popup_rx) = context(&hub, "popup");
        // Attached but never answers
        let (_bg_transport, _bg_rx) = hub.attach("bg");

        let result = popup
            .query(&ContextId::new("bg"), SectionKey::Ui, Duration::from_millis(500))
            .await;

        assert!(matches!(result, Err(ConcordError::Timeout { .. })));
        assert_eq!(popup.pending_queries(), 0);
        assert_eq!(popup.stats().queries_timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_queries_release_waiters() {
        let hub = LocalHub::new();
        let (popup, _store, _popup_rx) = context(&hub, "popup");
        let (_bg_transport, _bg_rx) = hub.attach("bg");
        let bg = ContextId::new("bg");

        for _ in 0..10 {
            let caller_gave_up = tokio::time::timeout(
                Duration::from_millis(10),
                popup.query(&bg, SectionKey::Settings, Duration::from_secs(5)),
            )
            .await;
            assert!(caller_gave_up.is_err());
        }
        assert_eq!(popup.pending_queries(), 0);

        // Aborted task holding a query
        let task = {
            let popup = Arc::clone(&popup);
            tokio::spawn(async move {
                let _ = popup
                    .query(&ContextId::new("bg"), SectionKey::Ui, Duration::from_secs(5))
                    .await;
            })
        };
        while popup.pending_queries() == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;
        assert_eq!(popup.pending_queries(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(popup.pending_queries(), 0);
        assert_eq!(popup.stats().queries_timed_out, 0);
    }

    #[tokio::test]
    async fn test_observer_sees_failed_count() {
        let hub = LocalHub::new();
        let (bg, bg_store, _bg_rx) = context(&hub, "bg");
        let (_popup_transport, _popup_rx) = hub.attach("popup");
        let (_tab_transport, tab_rx) = hub.attach("tab-1");
        drop(tab_rx);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bg.set_observer(Arc::new(move |section: SectionKey, report: &BroadcastReport| {
            sink.lock().push((section, report.failed_count()));
        }));

        let commit = bg_store
            .mutate(SectionKey::Ui, patch::set_expanded("history", true))
            .unwrap();
        bg.publish(&commit).await;

        assert_eq!(*seen.lock(), vec![(SectionKey::Ui, 1)]);
        assert_eq!(bg.stats().failed_destinations, 1);
        assert_eq!(bg.stats().delivered, 1);
    }
}
