//! Change events, the unit of synchronization.
//!
//! Events travel as one JSON object per WebSocket text message. Field names
//! on the wire use the short camelCase form expected by the sync endpoint:
//!
//! ```json
//! {"id":"...","type":"update","entity":"offering","data":{"id":"x"},"timestamp":1700000000000,"version":1}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Payload schema version written on every event created by this client.
pub const SCHEMA_VERSION: u32 = 1;

/// Kind of change carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
    SyncRequest,
    SyncResponse,
}

impl ChangeKind {
    /// Returns true for `create`, `update` and `delete`.
    pub fn is_data_change(&self) -> bool {
        matches!(
            self,
            ChangeKind::Create | ChangeKind::Update | ChangeKind::Delete
        )
    }

    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
            ChangeKind::SyncRequest => "sync_request",
            ChangeKind::SyncResponse => "sync_response",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeKind::Create),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            "sync_request" => Ok(ChangeKind::SyncRequest),
            "sync_response" => Ok(ChangeKind::SyncResponse),
            other => Err(SyncError::MalformedEvent(format!(
                "unknown change kind '{}'",
                other
            ))),
        }
    }
}

/// A single synchronization event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Client-generated identifier, unique within a session.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    /// Logical collection name, e.g. "offering".
    pub entity: String,
    /// Record for create/update, record identifier for delete,
    /// control metadata for sync requests and responses.
    #[serde(rename = "data", default)]
    pub payload: Value,
    /// Milliseconds since the Unix epoch.
    #[serde(rename = "timestamp")]
    pub occurred_at: i64,
    #[serde(
        rename = "userId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub origin_user_id: Option<String>,
    #[serde(rename = "version", default = "default_schema_version")]
    pub schema_version: u32,
    /// Set on events produced by a field merge.
    #[serde(
        rename = "mergedAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub merged_at: Option<i64>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Identity of the record an event applies to: `(entity, record id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalKey {
    pub entity: String,
    pub record_id: String,
}

impl std::fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity, self.record_id)
    }
}

impl ChangeEvent {
    /// Creates an event with a fresh id and the current schema version.
    pub fn new(
        kind: ChangeKind,
        entity: impl Into<String>,
        payload: Value,
        occurred_at: i64,
    ) -> Self {
        Self {
            id: generate_event_id(),
            kind,
            entity: entity.into(),
            payload,
            occurred_at,
            origin_user_id: None,
            schema_version: SCHEMA_VERSION,
            merged_at: None,
        }
    }

    /// Sets the acting user.
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.origin_user_id = user_id;
        self
    }

    /// Returns the identifier of the record this event targets.
    ///
    /// See [`record_id_of`].
    pub fn record_id(&self) -> Option<String> {
        record_id_of(self.kind, &self.payload)
    }

    /// Computes the logical key, failing for events that lack an entity or
    /// a record id.
    pub fn logical_key(&self) -> Result<LogicalKey, SyncError> {
        if self.entity.trim().is_empty() {
            return Err(SyncError::MalformedEvent(format!(
                "event {} has no entity",
                self.id
            )));
        }
        let record_id = self.record_id().ok_or_else(|| {
            SyncError::MalformedEvent(format!(
                "event {} on '{}' has no record id",
                self.id, self.entity
            ))
        })?;
        Ok(LogicalKey {
            entity: self.entity.clone(),
            record_id,
        })
    }

    /// Returns true if this event targets the given record.
    pub fn matches_key(&self, key: &LogicalKey) -> bool {
        self.entity == key.entity && self.record_id().as_deref() == Some(key.record_id.as_str())
    }

    /// Encodes the event as a JSON text message.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes an event from a JSON text message.
    pub fn decode(text: &str) -> Result<Self, SyncError> {
        serde_json::from_str(text).map_err(|e| SyncError::MalformedEvent(e.to_string()))
    }
}

/// Record identifier carried by a payload: its `id` field, or for a
/// `delete` the payload itself when it is a bare string or number.
///
/// Numeric ids are rendered in decimal. Empty strings are no id.
pub fn record_id_of(kind: ChangeKind, payload: &Value) -> Option<String> {
    let id = match payload {
        Value::String(_) | Value::Number(_) if kind == ChangeKind::Delete => payload,
        _ => payload.get("id")?,
    };
    match id {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Generates a random event id.
pub fn generate_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_uses_wire_field_names() {
        let mut event = ChangeEvent::new(
            ChangeKind::Update,
            "offering",
            json!({"id": "weekend-discourse", "price": "$27"}),
            1_700_000_000_000,
        );
        event.id = "e1".to_string();
        event.origin_user_id = Some("u1".to_string());

        let value: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "e1",
                "type": "update",
                "entity": "offering",
                "data": {"id": "weekend-discourse", "price": "$27"},
                "timestamp": 1_700_000_000_000i64,
                "userId": "u1",
                "version": 1
            })
        );
    }

    #[test]
    fn test_decode_without_optional_fields() {
        let event = ChangeEvent::decode(
            r#"{"id":"s1","type":"sync_response","entity":"metadata","data":{},"timestamp":5,"version":1}"#,
        )
        .unwrap();
        assert_eq!(event.kind, ChangeKind::SyncResponse);
        assert!(event.origin_user_id.is_none());
        assert!(event.merged_at.is_none());
    }

    #[test]
    fn test_decode_unknown_type_is_malformed() {
        let result = ChangeEvent::decode(
            r#"{"id":"x","type":"explode","entity":"offering","data":{},"timestamp":5,"version":1}"#,
        );
        assert!(matches!(result, Err(SyncError::MalformedEvent(_))));
    }

    #[test]
    fn test_logical_key() {
        let event = ChangeEvent::new(ChangeKind::Delete, "testimonial", json!({"id": 42}), 0);
        let key = event.logical_key().unwrap();
        assert_eq!(key.entity, "testimonial");
        assert_eq!(key.record_id, "42");
        assert!(event.matches_key(&key));
    }

    #[test]
    fn test_logical_key_requires_entity_and_id() {
        let no_id = ChangeEvent::new(ChangeKind::Update, "offering", json!({"price": 1}), 0);
        assert!(matches!(
            no_id.logical_key(),
            Err(SyncError::MalformedEvent(_))
        ));

        let no_entity = ChangeEvent::new(ChangeKind::Update, "", json!({"id": "x"}), 0);
        assert!(matches!(
            no_entity.logical_key(),
            Err(SyncError::MalformedEvent(_))
        ));

        let scalar_update = ChangeEvent::new(ChangeKind::Update, "offering", json!("x"), 0);
        assert!(scalar_update.logical_key().is_err());
        let empty_delete = ChangeEvent::new(ChangeKind::Delete, "offering", json!(""), 0);
        assert!(empty_delete.logical_key().is_err());
    }

    #[test]
    fn test_delete_payload_may_be_the_identifier() {
        let by_string = ChangeEvent::decode(
            r#"{"id":"e9","type":"delete","entity":"offering","data":"weekend","timestamp":5}"#,
        )
        .unwrap();
        let key = by_string.logical_key().unwrap();
        assert_eq!(key.record_id, "weekend");
        assert!(by_string.matches_key(&key));

        let by_number = ChangeEvent::new(ChangeKind::Delete, "testimonial", json!(7), 0);
        assert_eq!(by_number.record_id().as_deref(), Some("7"));

        let pending = ChangeEvent::new(ChangeKind::Update, "offering", json!({"id": "weekend"}), 0);
        assert!(pending.matches_key(&key));
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("sync_request".parse::<ChangeKind>().unwrap(), ChangeKind::SyncRequest);
        assert!("upsert".parse::<ChangeKind>().is_err());
        assert!(ChangeKind::Delete.is_data_change());
        assert!(!ChangeKind::SyncResponse.is_data_change());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = generate_event_id();
        let b = generate_event_id();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }
}
