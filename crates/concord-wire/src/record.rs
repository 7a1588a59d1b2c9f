//! Persistence record format
//!
//! `{ version, sections: { [key]: { timestamp, value } }, savedAt }`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use concord_core::{ConcordResult, SectionKey, StateSnapshot};

use crate::section::{deserialize_section_state, serialize_section_state};

/// Stored form of a [`StateSnapshot`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRecord {
    #[serde(default)]
    pub version: u64,
    pub sections: Map<String, Value>,
    #[serde(default)]
    pub saved_at: u64,
}

impl PersistedRecord {
    pub fn from_snapshot(snapshot: &StateSnapshot, saved_at: u64) -> Self {
        PersistedRecord {
            version: snapshot.version,
            sections: sections_to_map(snapshot),
            saved_at,
        }
    }

    pub fn into_snapshot(self) -> ConcordResult<StateSnapshot> {
        let mut snapshot = sections_from_map(&self.sections)?;
        snapshot.version = self.version;
        Ok(snapshot)
    }
}

/// All sections keyed by wire name
pub fn sections_to_map(snapshot: &StateSnapshot) -> Map<String, Value> {
    snapshot
        .sections
        .iter()
        .map(|(key, state)| (key.as_str().to_string(), serialize_section_state(state)))
        .collect()
}

/// Rebuild sections; absent keys keep their defaults, unknown keys are skipped
pub fn sections_from_map(sections: &Map<String, Value>) -> ConcordResult<StateSnapshot> {
    let mut snapshot = StateSnapshot::new();
    for (name, value) in sections {
        let key: SectionKey = match name.parse() {
            Ok(key) => key,
            Err(_) => {
                tracing::warn!(section = %name, "skipping unknown section in record");
                continue;
            }
        };
        *snapshot.section_mut(key) = deserialize_section_state(key, value)?;
    }
    Ok(snapshot)
}

/// Serialize a snapshot for storage
pub fn encode_snapshot(snapshot: &StateSnapshot, saved_at: u64) -> ConcordResult<String> {
    Ok(serde_json::to_string(&PersistedRecord::from_snapshot(
        snapshot, saved_at,
    ))?)
}

/// Parse a stored snapshot
pub fn decode_snapshot(raw: &str) -> ConcordResult<StateSnapshot> {
    let record: PersistedRecord = serde_json::from_str(raw)?;
    record.into_snapshot()
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{Conversation, LogicalTime, Record, SectionValue};
    use proptest::prelude::*;
    use serde_json::json;

    fn populated_snapshot() -> StateSnapshot {
        let mut snapshot = StateSnapshot::new();
        snapshot.version = 7;

        let convs = snapshot.section_mut(SectionKey::Conversations);
        let conversation = Conversation::new("c-1", "Hello").with_tag("pinned");
        convs
            .value
            .conversations_mut()
            .unwrap()
            .insert(conversation.id.clone(), conversation);
        convs.timestamp = LogicalTime(5);

        let prefs = snapshot.section_mut(SectionKey::Preferences);
        prefs
            .value
            .record_mut()
            .unwrap()
            .insert("theme".into(), json!("dark"));
        prefs.timestamp = LogicalTime(6);
        snapshot
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let snapshot = populated_snapshot();
        let raw = encode_snapshot(&snapshot, 1_700_000_000_000).unwrap();
        assert_eq!(decode_snapshot(&raw).unwrap(), snapshot);
    }

    #[test]
    fn test_float_fields_survive_storage() {
        let mut snapshot = StateSnapshot::new();
        let settings = snapshot.section_mut(SectionKey::Settings);
        let fields = settings.value.record_mut().unwrap();
        fields.insert("ratio".into(), json!(0.030366074329203574));
        fields.insert("volume".into(), json!(0.9976354335106961));
        fields.insert("nested".into(), json!({"scale": [1.0715660391465826e-75, 0.5]}));
        settings.timestamp = LogicalTime(2);

        let raw = encode_snapshot(&snapshot, 0).unwrap();
        assert_eq!(decode_snapshot(&raw).unwrap(), snapshot);
    }

    #[test]
    fn test_default_snapshot_roundtrip() {
        let snapshot = StateSnapshot::new();
        let raw = encode_snapshot(&snapshot, 0).unwrap();
        assert_eq!(decode_snapshot(&raw).unwrap(), snapshot);
    }

    #[test]
    fn test_record_shape() {
        let record = PersistedRecord::from_snapshot(&populated_snapshot(), 99);
        let value = serde_json::to_value(&record).unwrap();

        assert_eq!(value["savedAt"], json!(99));
        assert_eq!(value["version"], json!(7));
        assert_eq!(value["sections"]["preferences"]["value"]["theme"], json!("dark"));
        assert!(value["sections"]["conversations"]["value"].is_array());
    }

    #[test]
    fn test_missing_and_unknown_sections() {
        let raw = json!({
            "sections": {
                "settings": {"timestamp": 3, "value": {"autosave": true}},
                "billing": {"timestamp": 1, "value": {}}
            },
            "savedAt": 10
        })
        .to_string();

        let snapshot = decode_snapshot(&raw).unwrap();
        assert_eq!(snapshot.section(SectionKey::Settings).timestamp, LogicalTime(3));
        assert_eq!(
            snapshot.section(SectionKey::Ui).value,
            SectionValue::default_for(SectionKey::Ui)
        );
    }

    fn arb_conversation() -> impl Strategy<Value = Conversation> {
        (
            "[a-z0-9-]{1,8}",
            ".{0,12}",
            proptest::collection::btree_set("[a-z]{1,6}", 0..4),
            proptest::collection::vec(("user|assistant", ".{0,16}", 0u64..10_000), 0..4),
        )
            .prop_map(|(id, title, tags, messages)| {
                let mut conversation = Conversation::new(id, title);
                conversation.tags = tags;
                for (role, content, ts) in messages {
                    conversation = conversation.with_message(&role, &content, ts);
                }
                conversation
            })
    }

    fn arb_finite_f64() -> impl Strategy<Value = f64> {
        any::<f64>().prop_filter("json has no nan or infinity", |f| f.is_finite())
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            arb_finite_f64().prop_map(|f| json!(f)),
            (0.0f64..1.0).prop_map(|f| json!(f)),
            ".{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                proptest::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|fields| Value::Object(fields.into_iter().collect())),
            ]
        })
    }

    fn arb_record() -> impl Strategy<Value = Record> {
        proptest::collection::btree_map("[a-zA-Z]{1,8}", arb_json(), 0..6)
    }

    fn arb_snapshot() -> impl Strategy<Value = StateSnapshot> {
        (
            proptest::collection::vec(arb_conversation(), 0..5),
            arb_record(),
            arb_record(),
            (
                proptest::option::of("[a-z0-9-]{1,8}"),
                proptest::collection::btree_set("[a-z]{1,6}", 0..4),
                arb_record(),
            ),
            0u64..1_000,
            proptest::array::uniform4(1u64..1_000_000),
        )
            .prop_map(|(conversations, prefs, settings, ui_parts, version, stamps)| {
                let mut snapshot = StateSnapshot::new();
                snapshot.version = version;

                let section = snapshot.section_mut(SectionKey::Conversations);
                for conversation in conversations {
                    section
                        .value
                        .conversations_mut()
                        .unwrap()
                        .insert(conversation.id.clone(), conversation);
                }

                *snapshot.section_mut(SectionKey::Preferences).value.record_mut().unwrap() = prefs;
                *snapshot.section_mut(SectionKey::Settings).value.record_mut().unwrap() = settings;

                let (active, expanded, fields) = ui_parts;
                let ui = snapshot.section_mut(SectionKey::Ui).value.ui_mut().unwrap();
                ui.active_conversation = active;
                ui.expanded = expanded;
                ui.fields = fields;

                for (key, ts) in SectionKey::ALL.into_iter().zip(stamps) {
                    snapshot.section_mut(key).timestamp = LogicalTime(ts);
                }
                snapshot
            })
    }

    proptest! {
        #[test]
        fn prop_snapshot_survives_storage(snapshot in arb_snapshot()) {
            let raw = encode_snapshot(&snapshot, 0).unwrap();
            prop_assert_eq!(decode_snapshot(&raw).unwrap(), snapshot);
        }
    }
}
