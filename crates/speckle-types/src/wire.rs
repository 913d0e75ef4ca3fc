//! JSON field names and type discriminators of the fragment wire format.

/// Discriminator field present on every serialized object.
pub const SPECKLE_TYPE: &str = "speckle_type";

/// Content id, always the last field written.
pub const ID: &str = "id";

/// Optional application correlation key. Written but never hashed.
pub const APPLICATION_ID: &str = "applicationId";

/// Descendant id to minimum depth map of a fragment.
pub const CLOSURE: &str = "__closure";

/// Size of the closure, written on every detached fragment.
pub const TOTAL_CHILDREN_COUNT: &str = "totalChildrenCount";

/// Target id of a reference placeholder.
pub const REFERENCED_ID: &str = "referencedId";

/// Discriminator of reference placeholders.
pub const REFERENCE_TYPE: &str = "reference";

/// Discriminator of the generic base type.
pub const BASE_TYPE: &str = "Base";

/// Discriminator of chunk wrappers.
pub const DATA_CHUNK_TYPE: &str = "Speckle.Core.Models.DataChunk";

/// Discriminator of file-backed blobs.
pub const BLOB_TYPE: &str = "Speckle.Core.Models.Blob";

/// Payload list of a chunk.
pub const CHUNK_DATA: &str = "data";

/// Separator between segments of an inheritance chain discriminator.
pub const TYPE_CHAIN_SEPARATOR: char = ':';

/// Prefix marking a dynamic property as ignored.
pub const IGNORED_PREFIX: &str = "__";

/// Prefix marking a dynamic property as detached.
pub const DETACH_PREFIX: char = '@';

/// Field names the engine owns. User properties may not use them.
pub const RESERVED_NAMES: &[&str] = &[
    ID,
    SPECKLE_TYPE,
    APPLICATION_ID,
    CLOSURE,
    TOTAL_CHILDREN_COUNT,
];

/// Returns `true` if `name` is one of the engine-owned field names.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

/// Wire key under which blob payloads are addressed.
pub fn blob_key(hash: &str) -> String {
    format!("blob:{hash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names() {
        assert!(is_reserved("id"));
        assert!(is_reserved("__closure"));
        assert!(!is_reserved("name"));
    }

    #[test]
    fn blob_key_prefix() {
        assert_eq!(blob_key("abc"), "blob:abc");
    }
}
