//! The unit of work carried by the queue.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::UnixMillis;
use crate::error::{CoreError, CoreResult};
use crate::id::ItemId;

/// Field names owned by the queue itself.
pub const RESERVED_FIELDS: [&str; 2] = ["id", "ts"];

/// A queued item: `id` and `ts` plus arbitrary caller fields, all serialized
/// as one flat JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    /// Enqueue time (unix ms).
    pub ts: UnixMillis,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl QueueItem {
    /// Build an item from a caller payload.
    ///
    /// Object payloads are flattened next to `id`/`ts`; any other JSON value
    /// is stored under a single `value` field.
    pub fn new(payload: Value, now: UnixMillis) -> CoreResult<Self> {
        let fields = match payload {
            Value::Object(map) => {
                if let Some(key) = RESERVED_FIELDS.iter().find(|k| map.contains_key(**k)) {
                    return Err(CoreError::invalid_payload(format!(
                        "field '{key}' is reserved by the queue"
                    )));
                }
                map
            }
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        Ok(Self {
            id: ItemId::next(now),
            ts: now,
            fields,
        })
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}
