//! State store - canonical in-memory state
//!
//! All writes go through here:
//! - `mutate`: local write (validate, apply, stamp, notify)
//! - `apply_remote`: last-writer-wins replacement of a whole section
//!
//! Both are synchronous. Persistence and broadcast are scheduled by the
//! caller as separate continuations.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use concord_core::{
    ChangeSource, ClockMode, ConcordResult, ContextId, LogicalClock, LogicalTime, SectionKey,
    SectionState, SectionValue, StateEvent, StateSnapshot,
};

use crate::{SubscriberRegistry, SubscriptionToken, ValidatorSet};

/// A committed local write
#[derive(Clone, Debug, PartialEq)]
pub struct Commit {
    pub section: SectionKey,
    /// Global version after the write
    pub version: u64,
    /// Section timestamp stamped by the write
    pub timestamp: LogicalTime,
    /// Whole section value after the write
    pub value: SectionValue,
}

impl Commit {
    pub fn state(&self) -> SectionState {
        SectionState::new(self.value.clone(), self.timestamp)
    }
}

/// Result of offering a remote section to the store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Remote value replaced the local section
    Applied { version: u64 },
    /// Remote value was not newer; local section kept
    Stale { local: LogicalTime },
}

impl RemoteOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, RemoteOutcome::Applied { .. })
    }
}

struct StoreInner {
    snapshot: StateSnapshot,
    clock: LogicalClock,
    /// Section -> global version at which it was last written
    dirty: BTreeMap<SectionKey, u64>,
}

/// Canonical state of one context
pub struct StateStore {
    context: ContextId,
    inner: RwLock<StoreInner>,
    validators: ValidatorSet,
    subscribers: Arc<SubscriberRegistry<StateEvent>>,
}

impl StateStore {
    /// Create a store seeded with a snapshot (defaults or loaded from storage)
    pub fn new(
        context: ContextId,
        snapshot: StateSnapshot,
        clock: ClockMode,
        validators: ValidatorSet,
    ) -> Self {
        let mut clock = LogicalClock::new(clock);
        clock.observe(snapshot.latest_timestamp());

        StateStore {
            context,
            inner: RwLock::new(StoreInner {
                snapshot,
                clock,
                dirty: BTreeMap::new(),
            }),
            validators,
            subscribers: Arc::new(SubscriberRegistry::new()),
        }
    }

    /// Default sections, counter clock, standard validators
    pub fn with_defaults(context: impl Into<ContextId>) -> Self {
        Self::new(
            context.into(),
            StateSnapshot::new(),
            ClockMode::Counter,
            ValidatorSet::standard(),
        )
    }

    /// Share a registry with other components (e.g. the realtime channel)
    pub fn with_subscribers(mut self, subscribers: Arc<SubscriberRegistry<StateEvent>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    pub fn context(&self) -> &ContextId {
        &self.context
    }

    pub fn subscribers(&self) -> &Arc<SubscriberRegistry<StateEvent>> {
        &self.subscribers
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionToken
    where
        F: Fn(&StateEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(listener)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.subscribers.unsubscribe(token)
    }

    /// Read-only copy of a section value
    pub fn get(&self, section: SectionKey) -> SectionValue {
        self.inner.read().snapshot.section(section).value.clone()
    }

    /// Section value with its write timestamp
    pub fn section(&self, section: SectionKey) -> SectionState {
        self.inner.read().snapshot.section(section).clone()
    }

    pub fn section_timestamp(&self, section: SectionKey) -> LogicalTime {
        self.inner.read().snapshot.section(section).timestamp
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.read().snapshot.clone()
    }

    pub fn version(&self) -> u64 {
        self.inner.read().snapshot.version
    }

    /// Next tick of this context's clock (for envelopes that carry no commit)
    pub fn next_timestamp(&self) -> LogicalTime {
        self.inner.write().clock.tick()
    }

    /// Apply a local patch to a section
    ///
    /// The patch runs on a copy; the copy is validated and only then
    /// swapped in. On any error the section is left untouched.
    /// The patch must not call back into the store.
    pub fn mutate<P>(&self, section: SectionKey, patch: P) -> ConcordResult<Commit>
    where
        P: FnOnce(&mut SectionValue) -> ConcordResult<()>,
    {
        let commit = {
            let mut inner = self.inner.write();
            let mut candidate = inner.snapshot.section(section).value.clone();

            patch(&mut candidate)?;
            self.validators.validate(section, &candidate)?;

            let timestamp = inner.clock.tick();
            inner.snapshot.version += 1;
            let version = inner.snapshot.version;

            let state = inner.snapshot.section_mut(section);
            state.value = candidate.clone();
            state.timestamp = timestamp;
            inner.dirty.insert(section, version);

            Commit {
                section,
                version,
                timestamp,
                value: candidate,
            }
        };

        tracing::debug!(
            context = %self.context,
            section = %section,
            version = commit.version,
            timestamp = %commit.timestamp,
            "committed local mutation"
        );
        self.subscribers.notify(&StateEvent::SectionChanged {
            section,
            version: commit.version,
            timestamp: commit.timestamp,
            source: ChangeSource::Local,
        });
        Ok(commit)
    }

    /// Offer a remote copy of a section (last-writer-wins, whole section)
    ///
    /// Replaces the local section only if the remote timestamp is strictly
    /// greater. Equal or older copies are stale, which makes replays
    /// idempotent.
    pub fn apply_remote(
        &self,
        section: SectionKey,
        incoming: SectionState,
        source: ChangeSource,
    ) -> ConcordResult<RemoteOutcome> {
        self.validators.validate(section, &incoming.value)?;

        let outcome = {
            let mut inner = self.inner.write();
            inner.clock.observe(incoming.timestamp);

            let local = inner.snapshot.section(section).timestamp;
            if incoming.timestamp <= local {
                RemoteOutcome::Stale { local }
            } else {
                inner.snapshot.version += 1;
                let version = inner.snapshot.version;
                *inner.snapshot.section_mut(section) = incoming.clone();
                inner.dirty.insert(section, version);
                RemoteOutcome::Applied { version }
            }
        };

        match outcome {
            RemoteOutcome::Applied { version } => {
                tracing::debug!(
                    context = %self.context,
                    section = %section,
                    version,
                    timestamp = %incoming.timestamp,
                    ?source,
                    "applied remote section"
                );
                self.subscribers.notify(&StateEvent::SectionChanged {
                    section,
                    version,
                    timestamp: incoming.timestamp,
                    source,
                });
            }
            RemoteOutcome::Stale { local } => {
                tracing::trace!(
                    context = %self.context,
                    section = %section,
                    remote = %incoming.timestamp,
                    local = %local,
                    "discarded stale section"
                );
            }
        }
        Ok(outcome)
    }

    /// Sections written since they were last persisted
    pub fn dirty_sections(&self) -> Vec<SectionKey> {
        self.inner.read().dirty.keys().copied().collect()
    }

    pub fn is_dirty(&self) -> bool {
        !self.inner.read().dirty.is_empty()
    }

    /// Clear dirty marks covered by a persisted snapshot
    ///
    /// Sections written after the snapshot was taken stay dirty.
    pub fn mark_persisted(&self, snapshot: &StateSnapshot) {
        self.inner
            .write()
            .dirty
            .retain(|_, written_at| *written_at > snapshot.version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch;
    use concord_core::ConcordError;
    use parking_lot::Mutex;
    use serde_json::json;

    fn store() -> StateStore {
        StateStore::with_defaults("bg")
    }

    fn prefs(theme: &str, ts: u64) -> SectionState {
        let mut value = SectionValue::default_for(SectionKey::Preferences);
        value.record_mut().unwrap().insert("theme".into(), json!(theme));
        SectionState::new(value, LogicalTime(ts))
    }

    #[test]
    fn test_mutate_bumps_version_and_timestamp() {
        let store = store();
        let before = store.version();

        let commit = store
            .mutate(SectionKey::Preferences, patch::merge_record(json!({"theme": "dark"})))
            .unwrap();

        assert_eq!(commit.version, before + 1);
        assert_eq!(store.version(), before + 1);
        assert!(commit.timestamp > LogicalTime::ZERO);
        assert_eq!(store.section_timestamp(SectionKey::Preferences), commit.timestamp);
        assert_eq!(
            store.get(SectionKey::Preferences).record().unwrap()["theme"],
            json!("dark")
        );
        assert_eq!(store.dirty_sections(), vec![SectionKey::Preferences]);
    }

    #[test]
    fn test_validation_failure_leaves_state_unchanged() {
        let validators = ValidatorSet::standard().with(SectionKey::Settings, |value| {
            match value.record().and_then(|r| r.get("maxTabs")) {
                Some(n) if n.as_u64().unwrap_or(0) > 50 => Err("maxTabs too large".into()),
                _ => Ok(()),
            }
        });
        let store = StateStore::new(
            ContextId::new("bg"),
            StateSnapshot::new(),
            ClockMode::Counter,
            validators,
        );
        let events = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&events);
        store.subscribe(move |_| *counter.lock() += 1);

        let result = store.mutate(
            SectionKey::Settings,
            patch::merge_record(json!({"maxTabs": 500, "autosave": true})),
        );

        assert!(matches!(result, Err(ConcordError::Validation { .. })));
        assert_eq!(store.version(), 0);
        assert!(store.get(SectionKey::Settings).record().unwrap().is_empty());
        assert!(!store.is_dirty());
        assert_eq!(*events.lock(), 0);
    }

    #[test]
    fn test_failing_patch_is_not_applied() {
        let store = store();
        let result = store.mutate(SectionKey::Ui, |value| {
            value.record_mut().unwrap().insert("half".into(), json!(1));
            Err(ConcordError::validation(SectionKey::Ui, "abort"))
        });

        assert!(result.is_err());
        assert!(store.get(SectionKey::Ui).record().unwrap().is_empty());
    }

    #[test]
    fn test_remote_newer_replaces_whole_section() {
        let store = store();
        store
            .mutate(
                SectionKey::Preferences,
                patch::merge_record(json!({"theme": "light", "font": "serif"})),
            )
            .unwrap();

        let outcome = store
            .apply_remote(SectionKey::Preferences, prefs("dark", 100), ChangeSource::Remote("popup".into()))
            .unwrap();

        assert!(outcome.is_applied());
        // No field merge: "font" is gone
        assert_eq!(store.section(SectionKey::Preferences), prefs("dark", 100));
    }

    #[test]
    fn test_remote_replay_is_stale() {
        let store = store();
        let source = ChangeSource::Remote("popup".into());

        store
            .apply_remote(SectionKey::Preferences, prefs("dark", 10), source.clone())
            .unwrap();
        let version = store.version();
        let replay = store
            .apply_remote(SectionKey::Preferences, prefs("dark", 10), source)
            .unwrap();

        assert_eq!(replay, RemoteOutcome::Stale { local: LogicalTime(10) });
        assert_eq!(store.version(), version);
    }

    #[test]
    fn test_local_write_after_remote_orders_later() {
        let store = store();
        store
            .apply_remote(SectionKey::Preferences, prefs("dark", 500), ChangeSource::Remote("a".into()))
            .unwrap();

        let commit = store
            .mutate(SectionKey::Preferences, patch::merge_record(json!({"theme": "light"})))
            .unwrap();
        assert!(commit.timestamp > LogicalTime(500));
    }

    #[test]
    fn test_mark_persisted_keeps_later_writes_dirty() {
        let store = store();
        store
            .mutate(SectionKey::Preferences, patch::merge_record(json!({"a": 1})))
            .unwrap();
        let persisted = store.snapshot();
        store
            .mutate(SectionKey::Settings, patch::merge_record(json!({"b": 2})))
            .unwrap();

        store.mark_persisted(&persisted);
        assert_eq!(store.dirty_sections(), vec![SectionKey::Settings]);
    }

    #[test]
    fn test_subscribers_see_source() {
        let store = store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe(move |event| sink.lock().push(event.clone()));

        store
            .mutate(SectionKey::Preferences, patch::merge_record(json!({"x": 1})))
            .unwrap();
        store
            .apply_remote(SectionKey::Ui, SectionState::new(SectionValue::default_for(SectionKey::Ui), LogicalTime(50)), ChangeSource::Realtime)
            .unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(matches!(
            &seen[0],
            StateEvent::SectionChanged { source: ChangeSource::Local, .. }
        ));
        assert!(matches!(
            &seen[1],
            StateEvent::SectionChanged { section: SectionKey::Ui, source: ChangeSource::Realtime, .. }
        ));
    }
}
