use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use speckle_codec::{DeserializerOptions, MissingReferencePolicy, SerializerOptions};

/// Settings of the send pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SendOptions {
    /// Fragments buffered between the serializer and the batcher.
    pub queue_capacity: usize,
    pub batch_max_items: usize,
    /// Upper bound on the summed JSON size of one batch. A single larger
    /// fragment still travels, alone.
    pub batch_max_bytes: usize,
    /// A partial batch is released after this long without new fragments.
    pub batch_idle_timeout_ms: u64,
    /// Concurrent uploads per target.
    pub upload_workers: usize,
    pub track_detached_children: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            batch_max_items: 1000,
            batch_max_bytes: 10 * 1024 * 1024,
            batch_idle_timeout_ms: 50,
            upload_workers: 4,
            track_detached_children: false,
        }
    }
}

impl SendOptions {
    pub fn batch_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_idle_timeout_ms)
    }

    pub fn serializer(&self) -> SerializerOptions {
        SerializerOptions {
            track_detached_children: self.track_detached_children,
        }
    }
}

/// Settings of the receive pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveOptions {
    /// Ids per local existence check.
    pub cache_check_batch_size: usize,
    /// Ids per remote download request.
    pub download_batch_size: usize,
    pub download_workers: usize,
    pub decode_workers: usize,
    pub missing_references: MissingReferencePolicy,
    /// Where blob files are downloaded. Blobs are left alone when unset.
    pub blob_dir: Option<PathBuf>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            cache_check_batch_size: 500,
            download_batch_size: 500,
            download_workers: 4,
            decode_workers: 4,
            missing_references: MissingReferencePolicy::Strict,
            blob_dir: None,
        }
    }
}

impl ReceiveOptions {
    pub fn deserializer(&self) -> DeserializerOptions {
        DeserializerOptions {
            missing_references: self.missing_references,
        }
    }
}
