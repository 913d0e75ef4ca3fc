use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use speckle_types::{Fragment, ObjectId};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{TransportError, TransportResult};
use crate::traits::{BlobStore, ObjectStore};

const BACKEND: &str = "disk";
const OBJECTS_DIR: &str = "objects";
const BLOBS_DIR: &str = "blobs";

/// Fragment store over a directory tree.
///
/// ```text
/// <root>/objects/<first two hex chars>/<id>.json
/// <root>/blobs/<id>
/// ```
///
/// Every write goes to a temporary file in the target directory and is
/// renamed into place, so a reader never sees a partial fragment.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> TransportResult<Self> {
        let root = root.into();
        for dir in [OBJECTS_DIR, BLOBS_DIR] {
            std::fs::create_dir_all(root.join(dir)).map_err(|e| TransportError::io(BACKEND, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(OBJECTS_DIR).join(&hex[..2]).join(format!("{hex}.json"))
    }

    pub fn blob_path(&self, id: &ObjectId) -> PathBuf {
        self.root.join(BLOBS_DIR).join(id.to_hex())
    }

    /// Sorted ids of every stored fragment. Files whose names are not ids
    /// are skipped.
    pub fn ids(&self) -> TransportResult<Vec<ObjectId>> {
        let mut ids = Vec::new();
        for entry in WalkDir::new(self.root.join(OBJECTS_DIR)).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| {
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed"));
                TransportError::io(BACKEND, source)
            })?;
            let name = entry.file_name().to_string_lossy();
            match name.strip_suffix(".json").map(ObjectId::from_hex) {
                Some(Ok(id)) => ids.push(id),
                _ => debug!(path = %entry.path().display(), "skipping foreign file"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8]) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_data()?;
        tmp.persist(dest).map_err(|e| e.error)?;
        Ok(())
    }

    fn read_fragment(path: &Path) -> std::io::Result<Option<String>> {
        match std::fs::read_to_string(path) {
            Ok(json) => Ok(Some(json)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn blocking<T, F>(f: F) -> TransportResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> std::io::Result<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| TransportError::io(BACKEND, std::io::Error::other(e)))?
            .map_err(|e| TransportError::io(BACKEND, e))
    }
}

#[async_trait]
impl ObjectStore for DiskStore {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn get(&self, id: &ObjectId) -> TransportResult<Option<String>> {
        let path = self.object_path(id);
        let found = Self::blocking(move || Self::read_fragment(&path)).await?;
        match found {
            Some(json) if json.trim().is_empty() => {
                warn!(id = %id, "ignoring empty fragment file");
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn put_batch(&self, fragments: &[Fragment]) -> TransportResult<()> {
        let jobs: Vec<(PathBuf, String)> = fragments
            .iter()
            .map(|f| (self.object_path(&f.id), f.json.clone()))
            .collect();
        Self::blocking(move || {
            for (path, json) in jobs {
                if path.exists() {
                    continue;
                }
                let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
                Self::write_atomic(&dir, &path, json.as_bytes())?;
            }
            Ok(())
        })
        .await
    }

    async fn get_batch(&self, ids: &[ObjectId]) -> TransportResult<HashMap<ObjectId, String>> {
        let jobs: Vec<(ObjectId, PathBuf)> = ids.iter().map(|id| (*id, self.object_path(id))).collect();
        Self::blocking(move || {
            let mut found = HashMap::with_capacity(jobs.len());
            for (id, path) in jobs {
                if let Some(json) = Self::read_fragment(&path)? {
                    if !json.trim().is_empty() {
                        found.insert(id, json);
                    }
                }
            }
            Ok(found)
        })
        .await
    }

    async fn has_batch(&self, ids: &[ObjectId]) -> TransportResult<HashSet<ObjectId>> {
        let jobs: Vec<(ObjectId, PathBuf)> = ids.iter().map(|id| (*id, self.object_path(id))).collect();
        Self::blocking(move || Ok(jobs.into_iter().filter(|(_, p)| p.is_file()).map(|(id, _)| id).collect())).await
    }

    fn blobs(&self) -> Option<&dyn BlobStore> {
        Some(self)
    }
}

#[async_trait]
impl BlobStore for DiskStore {
    async fn missing_blobs(&self, ids: &[ObjectId]) -> TransportResult<Vec<ObjectId>> {
        let jobs: Vec<(ObjectId, PathBuf)> = ids.iter().map(|id| (*id, self.blob_path(id))).collect();
        Self::blocking(move || Ok(jobs.into_iter().filter(|(_, p)| !p.is_file()).map(|(id, _)| id).collect())).await
    }

    async fn put_blob(&self, id: ObjectId, path: &Path) -> TransportResult<()> {
        let src = path.to_path_buf();
        let dest = self.blob_path(&id);
        let dir = self.root.join(BLOBS_DIR);
        Self::blocking(move || {
            if dest.is_file() {
                return Ok(());
            }
            let bytes = std::fs::read(&src)?;
            Self::write_atomic(&dir, &dest, &bytes)
        })
        .await
    }

    async fn get_blob(&self, id: &ObjectId, dest: &Path) -> TransportResult<bool> {
        let src = self.blob_path(id);
        let dest = dest.to_path_buf();
        Self::blocking(move || {
            if !src.is_file() {
                return Ok(false);
            }
            std::fs::copy(&src, &dest)?;
            Ok(true)
        })
        .await
    }
}
