//! Push events.
//!
//! Out-of-band changes announced by the server, applied to cached
//! collections without a fetch.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// == Operation ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOperation {
    /// A new item joined the collection
    Insert,
    /// An existing item changed
    Update,
    /// An item was removed
    Delete,
    /// An item was marked as seen/read
    MarkSeen,
}

impl fmt::Display for PushOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PushOperation::Insert => "insert",
            PushOperation::Update => "update",
            PushOperation::Delete => "delete",
            PushOperation::MarkSeen => "mark_seen",
        };
        f.write_str(name)
    }
}

// == Push Event ==
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    /// Kind of entity, e.g. "message" or "notification"
    pub entity_type: String,
    pub operation: PushOperation,
    pub entity_id: String,
    /// Cached collection the event patches; pages live under `<key>:page:<n>`
    pub collection_key: String,
    /// New item body for insert/update, ignored otherwise
    #[serde(default)]
    pub payload: Value,
}

impl PushEvent {
    pub fn new(
        entity_type: impl Into<String>,
        operation: PushOperation,
        entity_id: impl Into<String>,
        collection_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            operation,
            entity_id: entity_id.into(),
            collection_key: collection_key.into(),
            payload,
        }
    }

    pub fn insert(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        collection_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(entity_type, PushOperation::Insert, entity_id, collection_key, payload)
    }

    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        collection_key: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(entity_type, PushOperation::Update, entity_id, collection_key, payload)
    }

    pub fn delete(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        collection_key: impl Into<String>,
    ) -> Self {
        Self::new(entity_type, PushOperation::Delete, entity_id, collection_key, Value::Null)
    }

    pub fn mark_seen(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        collection_key: impl Into<String>,
    ) -> Self {
        Self::new(entity_type, PushOperation::MarkSeen, entity_id, collection_key, Value::Null)
    }

    /// Events with the same ordering key must be applied in arrival order.
    pub fn ordering_key(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_shape() {
        let event: PushEvent = serde_json::from_value(json!({
            "entity_type": "notification",
            "operation": "mark_seen",
            "entity_id": "n1",
            "collection_key": "notifications:inbox"
        }))
        .unwrap();

        assert_eq!(event.operation, PushOperation::MarkSeen);
        assert_eq!(event.payload, Value::Null);
        assert_eq!(event.ordering_key(), "notification:n1");
    }
}
