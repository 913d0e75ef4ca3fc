//! Types the engine itself relies on: chunks and blobs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use speckle_types::wire;

use crate::base::Base;
use crate::schema::{FieldType, TypeSchema};
use crate::value::Value;

/// Field of a blob holding the local path of its file.
pub const BLOB_FILE_PATH: &str = "filePath";

/// Field of a blob holding the file name it was created from.
pub const BLOB_ORIGINAL_NAME: &str = "originalFileName";

/// Schema of the chunk wrapper used for sliced collections.
pub fn data_chunk_schema() -> TypeSchema {
    TypeSchema::builder(wire::DATA_CHUNK_TYPE)
        .field(wire::CHUNK_DATA, FieldType::List)
        .build()
        .unwrap_or_else(|_| TypeSchema::base())
}

/// Schema of file-backed blobs.
pub fn blob_schema() -> TypeSchema {
    TypeSchema::builder(wire::BLOB_TYPE)
        .field(BLOB_FILE_PATH, FieldType::String)
        .field(BLOB_ORIGINAL_NAME, FieldType::String)
        .build()
        .unwrap_or_else(|_| TypeSchema::base())
}

/// Wrap a slice of a collection in a chunk object.
pub fn data_chunk(schema: &Arc<TypeSchema>, values: Vec<Value>) -> Base {
    let chunk = Base::new(schema.clone());
    chunk.set_unchecked(wire::CHUNK_DATA, Value::List(values));
    chunk
}

/// Returns `true` if `base` is a chunk wrapper.
pub fn is_data_chunk(base: &Base) -> bool {
    base.speckle_type() == wire::DATA_CHUNK_TYPE
}

/// Returns `true` if `base` is a file-backed blob.
pub fn is_blob(base: &Base) -> bool {
    base.speckle_type() == wire::BLOB_TYPE
}

/// Create a blob object pointing at `path`.
pub fn blob(schema: &Arc<TypeSchema>, path: &Path) -> Base {
    let blob = Base::new(schema.clone());
    let original = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    blob.set_unchecked(BLOB_FILE_PATH, Value::String(path.display().to_string()));
    blob.set_unchecked(BLOB_ORIGINAL_NAME, Value::String(original));
    blob
}

/// Local file path recorded on a blob.
pub fn blob_path(base: &Base) -> Option<PathBuf> {
    base.get(BLOB_FILE_PATH)
        .and_then(|v| v.as_str().map(PathBuf::from))
        .filter(|p| !p.as_os_str().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_holds_data() {
        let schema = Arc::new(data_chunk_schema());
        let chunk = data_chunk(&schema, vec![Value::Int(1), Value::Int(2)]);
        assert!(is_data_chunk(&chunk));
        assert_eq!(chunk.get("data").unwrap().as_list().unwrap().len(), 2);
    }

    #[test]
    fn blob_records_path_and_name() {
        let schema = Arc::new(blob_schema());
        let b = blob(&schema, Path::new("/tmp/model.ifc"));
        assert!(is_blob(&b));
        assert_eq!(blob_path(&b), Some(PathBuf::from("/tmp/model.ifc")));
        assert_eq!(b.get(BLOB_ORIGINAL_NAME), Some(Value::from("model.ifc")));
    }

    #[test]
    fn blob_without_path() {
        let schema = Arc::new(blob_schema());
        assert_eq!(blob_path(&Base::new(schema)), None);
    }
}
