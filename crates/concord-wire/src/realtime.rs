//! Realtime channel message format
//!
//! `{ type, data, timestamp, originId? }`
//!
//! State-carrying message types:
//! - `sync`: `data = { version, sections: { [key]: { timestamp, value } } }`
//! - `update`: `data = { section, timestamp, value }`

use serde_json::{json, Value};

use concord_core::{
    ConcordError, ConcordResult, RealtimeMessage, SectionKey, SectionState, StateSnapshot,
};

use crate::record::{sections_from_map, sections_to_map};
use crate::section::{deserialize_section_state, serialize_section_state};

/// Full-state sync message type
pub const MSG_SYNC: &str = "sync";
/// Single-section update message type
pub const MSG_UPDATE: &str = "update";
/// Keep-alive message type
pub const MSG_HEARTBEAT: &str = "heartbeat";

pub fn encode_message(message: &RealtimeMessage) -> ConcordResult<String> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode_message(frame: &str) -> ConcordResult<RealtimeMessage> {
    Ok(serde_json::from_str(frame)?)
}

/// Full-state sync message for a snapshot
pub fn sync_message(snapshot: &StateSnapshot, timestamp: u64) -> RealtimeMessage {
    RealtimeMessage::new(
        MSG_SYNC,
        json!({
            "version": snapshot.version,
            "sections": Value::Object(sections_to_map(snapshot)),
        }),
        timestamp,
    )
}

/// Single-section update message
pub fn update_message(section: SectionKey, state: &SectionState, timestamp: u64) -> RealtimeMessage {
    let mut data = serialize_section_state(state);
    if let Value::Object(fields) = &mut data {
        fields.insert("section".into(), json!(section.as_str()));
    }
    RealtimeMessage::new(MSG_UPDATE, data, timestamp)
}

pub fn heartbeat_message(timestamp: u64) -> RealtimeMessage {
    RealtimeMessage::new(MSG_HEARTBEAT, Value::Null, timestamp)
}

/// Section states carried by a `sync` message
pub fn parse_sync_data(data: &Value) -> ConcordResult<Vec<(SectionKey, SectionState)>> {
    let sections = data
        .get("sections")
        .and_then(Value::as_object)
        .ok_or_else(|| ConcordError::Codec("sync message without sections".into()))?;

    // Only sections actually present in the message; missing ones are not a claim
    let snapshot = sections_from_map(sections)?;
    Ok(snapshot
        .sections
        .into_iter()
        .filter(|(key, _)| sections.contains_key(key.as_str()))
        .collect())
}

/// Section state carried by an `update` message
pub fn parse_update_data(data: &Value) -> ConcordResult<(SectionKey, SectionState)> {
    let section: SectionKey = data
        .get("section")
        .and_then(Value::as_str)
        .ok_or_else(|| ConcordError::Codec("update message without section".into()))?
        .parse()?;
    Ok((section, deserialize_section_state(section, data)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{LogicalTime, SectionValue};

    #[test]
    fn test_sync_message_carries_all_sections() {
        let snapshot = StateSnapshot::new();
        let msg = sync_message(&snapshot, 5);

        assert_eq!(msg.kind, MSG_SYNC);
        let parsed = parse_sync_data(&msg.data).unwrap();
        assert_eq!(parsed.len(), SectionKey::ALL.len());
    }

    #[test]
    fn test_update_message_roundtrip() {
        let mut value = SectionValue::default_for(SectionKey::Settings);
        value.record_mut().unwrap().insert("lang".into(), json!("en"));
        let state = SectionState::new(value, LogicalTime(77));

        let msg = update_message(SectionKey::Settings, &state, 100);
        let frame = encode_message(&msg).unwrap();
        let decoded = decode_message(&frame).unwrap();

        let (section, parsed) = parse_update_data(&decoded.data).unwrap();
        assert_eq!(section, SectionKey::Settings);
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_partial_sync_only_claims_present_sections() {
        let data = json!({
            "sections": {"ui": {"timestamp": 2, "value": {"expanded": ["a"]}}}
        });
        let parsed = parse_sync_data(&data).unwrap();

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, SectionKey::Ui);
    }
}
