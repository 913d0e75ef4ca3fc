use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::closure::Closure;
use crate::error::TypeError;
use crate::id::ObjectId;
use crate::wire;

/// Placeholder for a detached object, addressed by its content id.
///
/// On the wire a reference is `{"speckle_type":"reference","referencedId":id}`.
/// The closure travels alongside in memory so that a caller holding a
/// reference from an earlier send can splice it into a new graph without the
/// referenced content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub referenced_id: ObjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closure: Option<Closure>,
}

impl ObjectReference {
    pub fn new(referenced_id: ObjectId) -> Self {
        Self {
            referenced_id,
            closure: None,
        }
    }

    pub fn with_closure(referenced_id: ObjectId, closure: Closure) -> Self {
        Self {
            referenced_id,
            closure: Some(closure),
        }
    }

    /// The wire placeholder for this reference.
    pub fn to_placeholder(&self) -> Value {
        placeholder(self.referenced_id)
    }

    /// If `value` is a reference placeholder, return its target id.
    ///
    /// Returns `Ok(None)` for any value that is not a placeholder and an error
    /// for a placeholder whose target is not a valid id.
    pub fn target_of(value: &Map<String, Value>) -> Result<Option<ObjectId>, TypeError> {
        if value.get(wire::SPECKLE_TYPE).and_then(Value::as_str) != Some(wire::REFERENCE_TYPE) {
            return Ok(None);
        }
        let raw = value
            .get(wire::REFERENCED_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| TypeError::InvalidReference("missing referencedId".into()))?;
        ObjectId::from_hex(raw).map(Some)
    }
}

/// Build the wire placeholder pointing at `id`.
pub fn placeholder(id: ObjectId) -> Value {
    let mut map = Map::new();
    map.insert(wire::SPECKLE_TYPE.into(), Value::from(wire::REFERENCE_TYPE));
    map.insert(wire::REFERENCED_ID.into(), Value::from(id.to_hex()));
    Value::Object(map)
}
