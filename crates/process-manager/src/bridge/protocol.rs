//! Wire protocol types for master-worker communication.
//!
//! Everything exchanged over the channel is an [`Envelope`]. Four kinds:
//! - **OneWay**: fire-and-forget, no name, no reply
//! - **Request**: carries a correlation id, the worker must answer it
//! - **Reply**: the answer, tagged with the request's correlation id
//! - **Event**: named one-way traffic (either direction)

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token pairing a Request envelope to its eventual Reply.
///
/// UUID v4 keeps ids unique among concurrently outstanding requests without
/// any reuse bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(uuid::Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeKind {
    OneWay,
    Request,
    Reply,
    Event,
}

/// The unit of wire exchange.
///
/// `payload: None` models "no value" and is omitted on the wire, so a worker
/// handler that returns nothing still produces a well-formed Reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    pub fn one_way(payload: Option<Value>) -> Self {
        Self {
            kind: EnvelopeKind::OneWay,
            correlation_id: None,
            name: None,
            payload,
        }
    }

    pub fn request(id: CorrelationId, payload: Option<Value>) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            correlation_id: Some(id),
            name: None,
            payload,
        }
    }

    pub fn reply(id: CorrelationId, payload: Option<Value>) -> Self {
        Self {
            kind: EnvelopeKind::Reply,
            correlation_id: Some(id),
            name: None,
            payload,
        }
    }

    pub fn event(name: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            kind: EnvelopeKind::Event,
            correlation_id: None,
            name: Some(name.into()),
            payload,
        }
    }
}

/// Encode raw bytes as the legacy `{"type":"Buffer","data":[..]}` payload.
///
/// Existing consumers expect this literal tag for binary values; byte order
/// is preserved in the `data` array.
pub fn buffer_payload(bytes: &[u8]) -> Value {
    serde_json::json!({ "type": "Buffer", "data": bytes })
}

/// Extract raw bytes from a legacy buffer payload, if the value carries one.
pub fn buffer_payload_bytes(value: &Value) -> Option<Vec<u8>> {
    if value.get("type")?.as_str()? != "Buffer" {
        return None;
    }
    value
        .get("data")?
        .as_array()?
        .iter()
        .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_id() -> CorrelationId {
        CorrelationId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap()
    }

    #[test]
    fn request_wire_shape() {
        let env = Envelope::request(test_id(), Some(json!({"dataMessage": "aa"})));
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({
                "kind": "request",
                "correlationId": "550e8400-e29b-41d4-a716-446655440000",
                "payload": {"dataMessage": "aa"},
            })
        );
    }

    #[test]
    fn one_way_omits_absent_fields() {
        let env = Envelope::one_way(None);
        assert_eq!(serde_json::to_value(&env).unwrap(), json!({"kind": "oneWay"}));
    }

    #[test]
    fn event_carries_name() {
        let env = Envelope::event("test", Some(json!("Test Data")));
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({"kind": "event", "name": "test", "payload": "Test Data"})
        );
    }

    #[test]
    fn reply_without_payload_round_trips_to_none() {
        let env = Envelope::reply(test_id(), None);
        let json = serde_json::to_string(&env).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind, EnvelopeKind::Reply);
        assert_eq!(parsed.correlation_id, Some(test_id()));
        assert_eq!(parsed.payload, None);
    }

    #[test]
    fn buffer_payload_uses_legacy_tag() {
        let payload = buffer_payload(&[13, 14, 10, 13, 11, 14, 14, 15]);
        assert_eq!(
            payload,
            json!({"type": "Buffer", "data": [13, 14, 10, 13, 11, 14, 14, 15]})
        );
    }

    #[test]
    fn buffer_payload_bytes_preserves_order() {
        let payload = buffer_payload(&[255, 0, 1]);
        assert_eq!(buffer_payload_bytes(&payload), Some(vec![255, 0, 1]));
    }

    #[test]
    fn buffer_payload_bytes_rejects_untagged_values() {
        assert_eq!(buffer_payload_bytes(&json!({"data": [1, 2]})), None);
        assert_eq!(
            buffer_payload_bytes(&json!({"type": "Buffer", "data": [300]})),
            None
        );
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_ne!(a, b);
    }
}
