//! Optimistic update tracker
//!
//! Tentative patches are kept as overlays keyed by entity and merged on
//! top of canonical state at read time. Overlays never touch the store,
//! storage or the transport. Confirming or rejecting an entity drops its
//! overlay; what is visible afterwards is whatever the store holds.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use concord_core::{now_millis, ConcordError, EntityKey, SectionValue};
use concord_wire::{conversation_to_value, serialize_ui};

use crate::StateStore;

/// An unconfirmed local change to one entity
#[derive(Clone, Debug, PartialEq)]
pub struct PendingOptimisticRecord {
    pub entity: EntityKey,
    /// JSON merge patches in application order
    pub patches: Vec<Value>,
    /// Wall-clock millis of the first patch
    pub created_at: u64,
}

/// Overlay of pending optimistic changes above a store
pub struct OptimisticTracker {
    store: Arc<StateStore>,
    pending: RwLock<BTreeMap<EntityKey, PendingOptimisticRecord>>,
}

impl OptimisticTracker {
    pub fn new(store: Arc<StateStore>) -> Self {
        OptimisticTracker {
            store,
            pending: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a tentative patch; returns the new visible value
    pub fn apply(&self, entity: EntityKey, patch: Value) -> Option<Value> {
        {
            let mut pending = self.pending.write();
            pending
                .entry(entity.clone())
                .or_insert_with(|| PendingOptimisticRecord {
                    entity: entity.clone(),
                    patches: Vec::new(),
                    created_at: now_millis(),
                })
                .patches
                .push(patch);
        }
        tracing::trace!(%entity, "optimistic overlay applied");
        self.view(&entity)
    }

    /// Canonical value with any overlay merged on top
    ///
    /// `None` means the entity does not exist (or the overlay deletes it).
    pub fn view(&self, entity: &EntityKey) -> Option<Value> {
        let canonical = self.canonical(entity);
        let pending = self.pending.read();
        let Some(record) = pending.get(entity) else {
            return canonical;
        };

        let mut visible = canonical.unwrap_or(Value::Null);
        for patch in &record.patches {
            merge_patch(&mut visible, patch);
        }
        (!visible.is_null()).then_some(visible)
    }

    /// Entity value in the store, ignoring overlays
    pub fn canonical(&self, entity: &EntityKey) -> Option<Value> {
        entity_value(&self.store.get(entity.section), &entity.id)
    }

    /// The real mutation committed; drop the overlay
    pub fn confirm(&self, entity: &EntityKey) -> bool {
        let dropped = self.pending.write().remove(entity).is_some();
        if dropped {
            tracing::trace!(%entity, "optimistic overlay confirmed");
        }
        dropped
    }

    /// The real mutation failed; drop the overlay so the prior value shows
    pub fn reject(&self, entity: &EntityKey, error: &ConcordError) -> bool {
        let dropped = self.pending.write().remove(entity).is_some();
        if dropped {
            tracing::debug!(%entity, %error, "optimistic overlay rolled back");
        }
        dropped
    }

    pub fn is_pending(&self, entity: &EntityKey) -> bool {
        self.pending.read().contains_key(entity)
    }

    pub fn pending(&self) -> Vec<PendingOptimisticRecord> {
        self.pending.read().values().cloned().collect()
    }
}

/// Look up one entity inside a section value
///
/// Conversations are addressed by id, record sections by field name. The
/// UI section also exposes `activeConversation` and `expanded`.
pub fn entity_value(section: &SectionValue, id: &str) -> Option<Value> {
    match section {
        SectionValue::Conversations(map) => map.get(id).map(conversation_to_value),
        SectionValue::Preferences(record) | SectionValue::Settings(record) => {
            record.get(id).cloned()
        }
        SectionValue::Ui(ui) => match id {
            "activeConversation" | "expanded" => {
                serialize_ui(ui).get(id).cloned().filter(|v| !v.is_null())
            }
            _ => ui.fields.get(id).cloned(),
        },
    }
}

/// Apply a JSON merge patch (RFC 7386) in place
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(fields) = target {
        for (name, value) in patch {
            if value.is_null() {
                fields.remove(name);
            } else {
                merge_patch(fields.entry(name.clone()).or_insert(Value::Null), value);
            }
        }
    }
}
