//! Per-section (de)serializers
//!
//! In-memory sections hold maps and sets. Persistence and the wire only
//! carry JSON-safe forms:
//! - maps become ordered `[key, value]` pair lists
//! - sets become sorted lists
//!
//! Each stateful section has a dedicated pair of functions here and
//! `deserialize_x(serialize_x(v)) == v` holds for all of them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use concord_core::{
    ChatMessage, ConcordError, ConcordResult, Conversation, ConversationMap, LogicalTime, Record,
    SectionKey, SectionState, SectionValue, UiState,
};

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    role: String,
    content: String,
    #[serde(default)]
    timestamp: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireConversation {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    updated_at: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUi {
    #[serde(default)]
    active_conversation: Option<String>,
    #[serde(default)]
    expanded: Vec<String>,
    #[serde(default)]
    fields: Record,
}

#[derive(Serialize, Deserialize)]
struct WireSectionState {
    timestamp: u64,
    value: Value,
}

fn codec_err(section: SectionKey, e: impl std::fmt::Display) -> ConcordError {
    ConcordError::Codec(format!("{}: {}", section, e))
}

// ----------------------------------------------------------------------------
// Conversations
// ----------------------------------------------------------------------------

/// Serialize one conversation (tag set becomes a sorted list)
pub fn conversation_to_value(conversation: &Conversation) -> Value {
    let wire = WireConversation {
        id: conversation.id.clone(),
        title: conversation.title.clone(),
        messages: conversation
            .messages
            .iter()
            .map(|m| WireMessage {
                role: m.role.clone(),
                content: m.content.clone(),
                timestamp: m.timestamp,
            })
            .collect(),
        // BTreeSet iterates in order
        tags: conversation.tags.iter().cloned().collect(),
        updated_at: conversation.updated_at,
    };
    serde_json::to_value(wire).unwrap_or(Value::Null)
}

pub fn conversation_from_value(value: &Value) -> ConcordResult<Conversation> {
    let wire = WireConversation::deserialize(value)
        .map_err(|e| codec_err(SectionKey::Conversations, e))?;
    Ok(Conversation {
        id: wire.id,
        title: wire.title,
        messages: wire
            .messages
            .into_iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content,
                timestamp: m.timestamp,
            })
            .collect(),
        tags: wire.tags.into_iter().collect(),
        updated_at: wire.updated_at,
    })
}

/// Conversation map as an ordered `[[id, conversation], ...]` list
pub fn serialize_conversations(map: &ConversationMap) -> Value {
    Value::Array(
        map.iter()
            .map(|(id, conversation)| json!([id, conversation_to_value(conversation)]))
            .collect(),
    )
}

pub fn deserialize_conversations(value: &Value) -> ConcordResult<ConversationMap> {
    let pairs = value
        .as_array()
        .ok_or_else(|| codec_err(SectionKey::Conversations, "expected a pair list"))?;

    let mut map = ConversationMap::new();
    for pair in pairs {
        match pair.as_array().map(Vec::as_slice) {
            Some([Value::String(id), conversation]) => {
                map.insert(id.clone(), conversation_from_value(conversation)?);
            }
            _ => {
                return Err(codec_err(
                    SectionKey::Conversations,
                    "expected [id, conversation] pair",
                ))
            }
        }
    }
    Ok(map)
}

// ----------------------------------------------------------------------------
// Records (preferences, settings)
// ----------------------------------------------------------------------------

pub fn serialize_record(record: &Record) -> Value {
    Value::Object(record.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

pub fn deserialize_record(section: SectionKey, value: &Value) -> ConcordResult<Record> {
    match value {
        Value::Object(fields) => Ok(fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        // Never-written sections may be stored as null
        Value::Null => Ok(Record::new()),
        _ => Err(codec_err(section, "expected an object")),
    }
}

// ----------------------------------------------------------------------------
// UI
// ----------------------------------------------------------------------------

pub fn serialize_ui(ui: &UiState) -> Value {
    let wire = WireUi {
        active_conversation: ui.active_conversation.clone(),
        expanded: ui.expanded.iter().cloned().collect(),
        fields: ui.fields.clone(),
    };
    serde_json::to_value(wire).unwrap_or(Value::Null)
}

pub fn deserialize_ui(value: &Value) -> ConcordResult<UiState> {
    if value.is_null() {
        return Ok(UiState::default());
    }
    let wire = WireUi::deserialize(value).map_err(|e| codec_err(SectionKey::Ui, e))?;
    Ok(UiState {
        active_conversation: wire.active_conversation,
        expanded: wire.expanded.into_iter().collect(),
        fields: wire.fields,
    })
}

// ----------------------------------------------------------------------------
// Dispatch
// ----------------------------------------------------------------------------

/// Serialize any section value to its persistence-safe form
pub fn serialize_section(value: &SectionValue) -> Value {
    match value {
        SectionValue::Conversations(map) => serialize_conversations(map),
        SectionValue::Preferences(record) | SectionValue::Settings(record) => {
            serialize_record(record)
        }
        SectionValue::Ui(ui) => serialize_ui(ui),
    }
}

/// Rebuild a section value from its persistence-safe form
pub fn deserialize_section(key: SectionKey, value: &Value) -> ConcordResult<SectionValue> {
    Ok(match key {
        SectionKey::Conversations => SectionValue::Conversations(deserialize_conversations(value)?),
        SectionKey::Preferences => SectionValue::Preferences(deserialize_record(key, value)?),
        SectionKey::Settings => SectionValue::Settings(deserialize_record(key, value)?),
        SectionKey::Ui => SectionValue::Ui(deserialize_ui(value)?),
    })
}

/// `{ timestamp, value }`
pub fn serialize_section_state(state: &SectionState) -> Value {
    let wire = WireSectionState {
        timestamp: state.timestamp.as_u64(),
        value: serialize_section(&state.value),
    };
    serde_json::to_value(wire).unwrap_or(Value::Null)
}

pub fn deserialize_section_state(key: SectionKey, value: &Value) -> ConcordResult<SectionState> {
    let wire = WireSectionState::deserialize(value).map_err(|e| codec_err(key, e))?;
    Ok(SectionState {
        value: deserialize_section(key, &wire.value)?,
        timestamp: LogicalTime::new(wire.timestamp),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_conversations() -> ConversationMap {
        let mut map = ConversationMap::new();
        let a = Conversation::new("c-1", "Trip planning")
            .with_tag("travel")
            .with_tag("2026")
            .with_message("user", "Book a train", 10)
            .with_message("assistant", "Which day?", 11);
        let b = Conversation::new("c-2", "Empty");
        map.insert(a.id.clone(), a);
        map.insert(b.id.clone(), b);
        map
    }

    #[test]
    fn test_conversations_roundtrip() {
        let map = sample_conversations();
        let restored = deserialize_conversations(&serialize_conversations(&map)).unwrap();
        assert_eq!(restored, map);
    }

    #[test]
    fn test_conversations_are_pair_list() {
        let value = serialize_conversations(&sample_conversations());
        let pairs = value.as_array().unwrap();

        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0][0], json!("c-1"));
        // Set serialized as sorted list
        assert_eq!(pairs[0][1]["tags"], json!(["2026", "travel"]));
    }

    #[test]
    fn test_empty_sections_roundtrip() {
        for key in SectionKey::ALL {
            let empty = SectionValue::default_for(key);
            let restored = deserialize_section(key, &serialize_section(&empty)).unwrap();
            assert_eq!(restored, empty);
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let mut record = Record::new();
        record.insert("theme".into(), json!("dark"));
        record.insert("fontSize".into(), json!(14));
        record.insert("shortcuts".into(), json!({"send": "ctrl+enter"}));

        let value = serialize_record(&record);
        assert_eq!(value["theme"], json!("dark"));
        assert_eq!(deserialize_record(SectionKey::Preferences, &value).unwrap(), record);
    }

    #[test]
    fn test_ui_roundtrip() {
        let mut ui = UiState {
            active_conversation: Some("c-1".into()),
            ..UiState::default()
        };
        ui.expanded.insert("history".into());
        ui.expanded.insert("favorites".into());
        ui.fields.insert("sidebarWidth".into(), json!(280));

        let value = serialize_ui(&ui);
        assert_eq!(value["expanded"], json!(["favorites", "history"]));
        assert_eq!(deserialize_ui(&value).unwrap(), ui);
    }

    #[test]
    fn test_section_state_carries_timestamp() {
        let mut value = SectionValue::default_for(SectionKey::Settings);
        value.record_mut().unwrap().insert("sync".into(), json!(true));
        let state = SectionState::new(value, LogicalTime(99));

        let encoded = serialize_section_state(&state);
        assert_eq!(encoded["timestamp"], json!(99));
        assert_eq!(
            deserialize_section_state(SectionKey::Settings, &encoded).unwrap(),
            state
        );
    }

    #[test]
    fn test_malformed_pair_rejected() {
        let bad = json!([["c-1"]]);
        assert!(matches!(
            deserialize_conversations(&bad),
            Err(ConcordError::Codec(_))
        ));
        assert!(deserialize_record(SectionKey::Settings, &json!([1, 2])).is_err());
    }
}
