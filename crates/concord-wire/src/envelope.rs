//! Envelope wire format
//!
//! `{ kind, context, section, payload, timestamp, requestId? }`
//! - UPDATE: payload is the serialized section value
//! - QUERY: payload is null, requestId required
//! - SYNC: payload is `{ timestamp, value }`, requestId set when answering a query

use serde::{Deserialize, Serialize};
use serde_json::Value;

use concord_core::{
    ConcordError, ConcordResult, ContextId, Envelope, EnvelopeBody, EnvelopeKind, LogicalTime,
    RequestId, SectionKey,
};

use crate::section::{
    deserialize_section, deserialize_section_state, serialize_section, serialize_section_state,
};

/// JSON shape of an envelope
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub kind: String,
    pub context: String,
    pub section: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl WireEnvelope {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let (payload, request_id) = match &envelope.body {
            EnvelopeBody::Update { value, .. } => (serialize_section(value), None),
            EnvelopeBody::Query { request_id, .. } => {
                (Value::Null, Some(request_id.as_str().to_string()))
            }
            EnvelopeBody::Sync {
                state, request_id, ..
            } => (
                serialize_section_state(state),
                request_id.as_ref().map(|r| r.as_str().to_string()),
            ),
        };

        WireEnvelope {
            kind: envelope.kind().as_str().to_string(),
            context: envelope.origin.as_str().to_string(),
            section: envelope.section().as_str().to_string(),
            payload,
            timestamp: envelope.timestamp.as_u64(),
            request_id,
        }
    }

    pub fn into_envelope(self) -> ConcordResult<Envelope> {
        let kind = EnvelopeKind::from_wire(&self.kind)
            .ok_or_else(|| ConcordError::Codec(format!("unknown envelope kind: {}", self.kind)))?;
        let section: SectionKey = self.section.parse()?;
        let origin = ContextId::from(self.context);
        let timestamp = LogicalTime::new(self.timestamp);
        let request_id = self.request_id.map(RequestId::from);

        let body = match kind {
            EnvelopeKind::Update => EnvelopeBody::Update {
                section,
                value: deserialize_section(section, &self.payload)?,
            },
            EnvelopeKind::Query => EnvelopeBody::Query {
                section,
                request_id: request_id
                    .ok_or_else(|| ConcordError::Codec("QUERY without requestId".into()))?,
            },
            EnvelopeKind::Sync => EnvelopeBody::Sync {
                section,
                state: deserialize_section_state(section, &self.payload)?,
                request_id,
            },
        };

        Ok(Envelope {
            origin,
            timestamp,
            body,
        })
    }
}

/// Encode an envelope to its JSON frame
pub fn encode_envelope(envelope: &Envelope) -> ConcordResult<String> {
    Ok(serde_json::to_string(&WireEnvelope::from_envelope(envelope))?)
}

/// Decode a JSON frame into an envelope
pub fn decode_envelope(frame: &str) -> ConcordResult<Envelope> {
    let wire: WireEnvelope = serde_json::from_str(frame)?;
    wire.into_envelope()
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{SectionState, SectionValue};
    use serde_json::json;

    fn preferences(theme: &str) -> SectionValue {
        let mut value = SectionValue::default_for(SectionKey::Preferences);
        value
            .record_mut()
            .unwrap()
            .insert("theme".into(), json!(theme));
        value
    }

    #[test]
    fn test_update_wire_shape() {
        let env = Envelope::update(ContextId::new("popup"), LogicalTime(12), preferences("dark"));
        let wire: Value = serde_json::from_str(&encode_envelope(&env).unwrap()).unwrap();

        assert_eq!(
            wire,
            json!({
                "kind": "UPDATE",
                "context": "popup",
                "section": "preferences",
                "payload": {"theme": "dark"},
                "timestamp": 12
            })
        );
        assert_eq!(decode_envelope(&wire.to_string()).unwrap(), env);
    }

    #[test]
    fn test_sync_answer_keeps_request_id() {
        let state = SectionState::new(preferences("light"), LogicalTime(4));
        let env = Envelope::sync(
            ContextId::new("bg"),
            LogicalTime(20),
            state,
            Some(RequestId::from("popup:1")),
        );

        let decoded = decode_envelope(&encode_envelope(&env).unwrap()).unwrap();
        assert_eq!(decoded.request_id().map(RequestId::as_str), Some("popup:1"));
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_update_keeps_float_bits() {
        let mut value = SectionValue::default_for(SectionKey::Settings);
        let fields = value.record_mut().unwrap();
        fields.insert("ratio".into(), json!(0.9122217316509271));
        fields.insert("tiny".into(), json!(-1.81996730402717e-179));
        let env = Envelope::update(ContextId::new("popup"), LogicalTime(3), value);

        assert_eq!(decode_envelope(&encode_envelope(&env).unwrap()).unwrap(), env);
    }

    #[test]
    fn test_query_requires_request_id() {
        let frame = json!({
            "kind": "QUERY",
            "context": "tab-1",
            "section": "settings",
            "timestamp": 3
        });
        assert!(matches!(
            decode_envelope(&frame.to_string()),
            Err(ConcordError::Codec(_))
        ));
    }

    #[test]
    fn test_unknown_kind_and_section_rejected() {
        let unknown_kind = json!({
            "kind": "DELETE", "context": "a", "section": "ui", "timestamp": 1
        });
        assert!(decode_envelope(&unknown_kind.to_string()).is_err());

        let unknown_section = json!({
            "kind": "UPDATE", "context": "a", "section": "billing", "payload": {}, "timestamp": 1
        });
        assert!(matches!(
            decode_envelope(&unknown_section.to_string()),
            Err(ConcordError::UnknownSection(_))
        ));
    }
}
