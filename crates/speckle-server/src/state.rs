use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use speckle_transport::MemoryStore;
use speckle_types::ObjectId;

use crate::config::ServerConfig;

/// Fragments and blobs of one stream.
#[derive(Debug)]
pub struct StreamData {
    pub objects: MemoryStore,
    blobs: RwLock<HashMap<ObjectId, Bytes>>,
}

impl StreamData {
    fn new(stream: &str) -> Self {
        Self {
            objects: MemoryStore::named(format!("stream:{stream}")),
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub fn blob(&self, id: &ObjectId) -> Option<Bytes> {
        self.blobs.read().get(id).cloned()
    }

    pub fn has_blob(&self, id: &ObjectId) -> bool {
        self.blobs.read().contains_key(id)
    }

    pub fn insert_blob(&self, id: ObjectId, bytes: Bytes) {
        self.blobs.write().entry(id).or_insert(bytes);
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }
}

/// Shared state behind every handler.
#[derive(Debug)]
pub struct ServerState {
    config: ServerConfig,
    streams: DashMap<String, Arc<StreamData>>,
    upload_requests: AtomicU64,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            streams: DashMap::new(),
            upload_requests: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stream(&self, stream: &str) -> Option<Arc<StreamData>> {
        self.streams.get(stream).map(|s| s.value().clone())
    }

    /// Streams come into existence on first write.
    pub fn stream_or_create(&self, stream: &str) -> Arc<StreamData> {
        self.streams
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(StreamData::new(stream)))
            .value()
            .clone()
    }

    pub fn object_count(&self, stream: &str) -> usize {
        self.stream(stream).map(|s| s.objects.len()).unwrap_or(0)
    }

    /// Fragments newly stored across all streams. Re-uploads of present
    /// fragments are not counted.
    pub fn stored_objects(&self) -> u64 {
        self.streams.iter().map(|s| s.value().objects.written()).sum()
    }

    /// Object upload requests received.
    pub fn upload_requests(&self) -> u64 {
        self.upload_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn count_upload(&self) {
        self.upload_requests.fetch_add(1, Ordering::Relaxed);
    }
}
