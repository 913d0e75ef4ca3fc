use serde::{Deserialize, Serialize};

use crate::id::ObjectId;

/// One content-addressed unit of stored or transmitted JSON.
///
/// `id` is the content hash of `json` with the id field itself (and the
/// application id) left out. Fragments are immutable: changed content means a
/// new fragment with a new id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub id: ObjectId,
    pub json: String,
    pub speckle_type: String,
}

impl Fragment {
    pub fn new(id: ObjectId, json: impl Into<String>, speckle_type: impl Into<String>) -> Self {
        Self {
            id,
            json: json.into(),
            speckle_type: speckle_type.into(),
        }
    }

    /// Size of the JSON payload in bytes.
    pub fn size(&self) -> usize {
        self.json.len()
    }
}
