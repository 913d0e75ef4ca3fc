use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use speckle_types::{Fragment, ObjectId};

use crate::error::{TransportError, TransportResult};
use crate::traits::{BlobStore, ObjectStore};

/// In-memory, HashMap-based fragment store.
///
/// Intended for tests, embedding, and as the hot tier in front of slower
/// ones. Blobs are kept in memory too.
pub struct MemoryStore {
    name: String,
    objects: RwLock<HashMap<ObjectId, String>>,
    blobs: RwLock<HashMap<ObjectId, Vec<u8>>>,
    written: AtomicU64,
    read: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(HashMap::new()),
            blobs: RwLock::new(HashMap::new()),
            written: AtomicU64::new(0),
            read: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.read().contains_key(id)
    }

    /// Fragments newly written since creation. Rewrites of a present id do
    /// not count.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Successful reads since creation.
    pub fn reads(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    /// Sorted ids of every stored fragment.
    pub fn ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.objects.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn clear(&self) {
        self.objects.write().clear();
        self.blobs.write().clear();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &ObjectId) -> TransportResult<Option<String>> {
        let found = self.objects.read().get(id).cloned();
        if found.is_some() {
            self.read.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    async fn put_batch(&self, fragments: &[Fragment]) -> TransportResult<()> {
        let mut map = self.objects.write();
        for fragment in fragments {
            if !map.contains_key(&fragment.id) {
                map.insert(fragment.id, fragment.json.clone());
                self.written.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    async fn get_batch(&self, ids: &[ObjectId]) -> TransportResult<HashMap<ObjectId, String>> {
        let map = self.objects.read();
        let found: HashMap<ObjectId, String> = ids
            .iter()
            .filter_map(|id| map.get(id).map(|json| (*id, json.clone())))
            .collect();
        self.read.fetch_add(found.len() as u64, Ordering::Relaxed);
        Ok(found)
    }

    async fn has_batch(&self, ids: &[ObjectId]) -> TransportResult<HashSet<ObjectId>> {
        let map = self.objects.read();
        Ok(ids.iter().filter(|id| map.contains_key(id)).copied().collect())
    }

    fn blobs(&self) -> Option<&dyn BlobStore> {
        Some(self)
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn missing_blobs(&self, ids: &[ObjectId]) -> TransportResult<Vec<ObjectId>> {
        let blobs = self.blobs.read();
        Ok(ids.iter().filter(|id| !blobs.contains_key(id)).copied().collect())
    }

    async fn put_blob(&self, id: ObjectId, path: &Path) -> TransportResult<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| TransportError::io(self.name.clone(), e))?;
        self.blobs.write().entry(id).or_insert(bytes);
        Ok(())
    }

    async fn get_blob(&self, id: &ObjectId, dest: &Path) -> TransportResult<bool> {
        let bytes = match self.blobs.read().get(id) {
            Some(bytes) => bytes.clone(),
            None => return Ok(false),
        };
        tokio::fs::write(dest, bytes)
            .await
            .map_err(|e| TransportError::io(self.name.clone(), e))?;
        Ok(true)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("name", &self.name)
            .field("object_count", &self.len())
            .field("blob_count", &self.blob_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(n: u8) -> Fragment {
        Fragment::new(ObjectId::from_bytes([n; 16]), format!("{{\"n\":{n}}}"), "Base")
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = MemoryStore::new();
        store.put(fragment(1)).await.unwrap();
        assert_eq!(store.get(&fragment(1).id).await.unwrap().as_deref(), Some("{\"n\":1}"));
        assert!(store.get(&fragment(2).id).await.unwrap().is_none());
        assert_eq!(store.reads(), 1);
    }

    #[tokio::test]
    async fn rewrites_are_not_counted() {
        let store = MemoryStore::new();
        store.put_batch(&[fragment(1), fragment(2)]).await.unwrap();
        store.put_batch(&[fragment(2), fragment(3)]).await.unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.written(), 3);
    }

    #[tokio::test]
    async fn batch_queries() {
        let store = MemoryStore::new();
        store.put_batch(&[fragment(1), fragment(3)]).await.unwrap();
        let ids: Vec<ObjectId> = (1..=4).map(|n| fragment(n).id).collect();

        let present = store.has_batch(&ids).await.unwrap();
        assert_eq!(present, HashSet::from([ids[0], ids[2]]));
        assert_eq!(store.missing(&ids).await.unwrap(), vec![ids[1], ids[3]]);

        let found = store.get_batch(&ids).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[&ids[2]], "{\"n\":3}");
    }

    #[tokio::test]
    async fn blobs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.bin");
        let dest = dir.path().join("out.bin");
        std::fs::write(&src, b"payload").unwrap();

        let store = MemoryStore::new();
        let blobs = store.blobs().unwrap();
        let id = ObjectId::from_bytes([9; 16]);
        assert_eq!(blobs.missing_blobs(&[id]).await.unwrap(), vec![id]);
        blobs.put_blob(id, &src).await.unwrap();
        assert!(blobs.missing_blobs(&[id]).await.unwrap().is_empty());
        assert!(blobs.get_blob(&id, &dest).await.unwrap());
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        assert!(!blobs.get_blob(&ObjectId::null(), &dest).await.unwrap());
    }
}
