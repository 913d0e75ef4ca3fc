use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use speckle_types::ObjectId;

use crate::canonical::{to_canonical_string, to_hash_string};

/// SHA-256 content hasher producing 32-hex-character object ids.
///
/// There is no salt and no domain tag: an id is a pure function of content,
/// so independent producers agree on it. A collision is treated as "same
/// object".
#[derive(Clone, Copy, Debug, Default)]
pub struct ContentHasher;

impl ContentHasher {
    /// Number of hex characters kept from the digest.
    pub const ID_HEX_LEN: usize = ObjectId::HEX_LEN;

    /// Hash raw bytes to an id.
    pub fn hash(data: &[u8]) -> ObjectId {
        ObjectId::from_digest(&Self::raw_hash(data))
    }

    /// Hash the UTF-8 bytes of a string.
    pub fn hash_str(s: &str) -> ObjectId {
        Self::hash(s.as_bytes())
    }

    /// Hash the canonical rendering of a JSON value.
    ///
    /// The caller is responsible for leaving out the fields that must not
    /// influence the id.
    pub fn hash_json(value: &Value) -> ObjectId {
        Self::hash_str(&to_canonical_string(value))
    }

    /// Id of a fragment body.
    ///
    /// The top-level `id` and every serialized object's `applicationId` are
    /// left out, so neither influences the result.
    pub fn hash_object(body: &Map<String, Value>) -> ObjectId {
        Self::hash_str(&to_hash_string(body))
    }

    /// Hash any serializable value through its canonical JSON form.
    pub fn hash_serializable<T: serde::Serialize>(value: &T) -> Result<ObjectId, HasherError> {
        let json = serde_json::to_value(value).map_err(|e| HasherError::Serialization(e.to_string()))?;
        Ok(Self::hash_json(&json))
    }

    /// Verify that data produces the expected id.
    pub fn verify(data: &[u8], expected: &ObjectId) -> bool {
        Self::hash(data) == *expected
    }

    /// Recompute the id of a serialized fragment and compare it with
    /// `expected`.
    ///
    /// Not valid for blob fragments, whose id comes from file bytes.
    pub fn verify_fragment(json: &str, expected: &ObjectId) -> Result<bool, HasherError> {
        let value: Value = serde_json::from_str(json).map_err(|e| HasherError::Serialization(e.to_string()))?;
        let map = value
            .as_object()
            .ok_or_else(|| HasherError::Serialization("fragment is not a JSON object".into()))?;
        Ok(Self::hash_object(map) == *expected)
    }

    /// Full SHA-256 digest.
    pub fn raw_hash(data: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    /// Hash everything a reader yields, in 64 KiB steps.
    pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<ObjectId> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        let digest: [u8; 32] = hasher.finalize().into();
        Ok(ObjectId::from_digest(&digest))
    }

    /// Hash a file's bytes. Used for blob ids.
    pub fn hash_file(path: &Path) -> Result<ObjectId, HasherError> {
        let file = File::open(path).map_err(|e| HasherError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::hash_reader(io::BufReader::new(file)).map_err(|e| HasherError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }
}

/// Errors from hashing operations.
#[derive(Debug, thiserror::Error)]
pub enum HasherError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}
