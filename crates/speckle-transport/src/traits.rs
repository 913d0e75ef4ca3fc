use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use speckle_types::{Fragment, ObjectId};

use crate::error::TransportResult;

/// A tier that stores fragment JSON by id.
///
/// All implementations must satisfy these invariants:
/// - Fragments are immutable once written; writing an id twice is a no-op.
/// - A miss is `Ok(None)` or an absent entry, never an error.
/// - Every persistence failure surfaces as a [`TransportError`](crate::TransportError);
///   nothing is dropped silently.
/// - The store never interprets fragment contents.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Short label used in logs and error messages.
    fn name(&self) -> &str;

    async fn get(&self, id: &ObjectId) -> TransportResult<Option<String>>;

    /// Write a batch of fragments.
    async fn put_batch(&self, fragments: &[Fragment]) -> TransportResult<()>;

    async fn put(&self, fragment: Fragment) -> TransportResult<()> {
        self.put_batch(std::slice::from_ref(&fragment)).await
    }

    /// Fetch every listed fragment the store has. Missing ids are left out
    /// of the result.
    async fn get_batch(&self, ids: &[ObjectId]) -> TransportResult<HashMap<ObjectId, String>> {
        let mut found = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(json) = self.get(id).await? {
                found.insert(*id, json);
            }
        }
        Ok(found)
    }

    /// The subset of `ids` present in the store, without fetching content.
    async fn has_batch(&self, ids: &[ObjectId]) -> TransportResult<HashSet<ObjectId>> {
        Ok(self.get_batch(ids).await?.into_keys().collect())
    }

    /// The subset of `ids` not yet present, in input order.
    async fn missing(&self, ids: &[ObjectId]) -> TransportResult<Vec<ObjectId>> {
        let present = self.has_batch(ids).await?;
        Ok(ids.iter().filter(|id| !present.contains(id)).copied().collect())
    }

    /// Make every accepted write durable and visible to readers.
    async fn flush(&self) -> TransportResult<()> {
        Ok(())
    }

    /// Blob capability, if this tier stores blobs.
    fn blobs(&self) -> Option<&dyn BlobStore> {
        None
    }
}

/// Storage of raw file bytes keyed by the SHA-256 of their content.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// The subset of `ids` not yet stored, in input order.
    async fn missing_blobs(&self, ids: &[ObjectId]) -> TransportResult<Vec<ObjectId>>;

    /// Store the file at `path` under `id`.
    async fn put_blob(&self, id: ObjectId, path: &Path) -> TransportResult<()>;

    /// Copy blob `id` to `dest`. Returns `false` if the blob does not exist.
    async fn get_blob(&self, id: &ObjectId, dest: &Path) -> TransportResult<bool>;
}
