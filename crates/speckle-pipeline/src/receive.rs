//! Receive path: root, closure, cache check, download, decode.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value as Json};
use speckle_codec::{BaseDeserializer, DecodeCache, DecodeStep, FragmentSet, MissingReferencePolicy};
use speckle_model::{builtins, Base, TypeRegistry, Value};
use speckle_transport::{BlobStore, ObjectStore, TransportError};
use speckle_types::{wire, Fragment, ObjectId};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{OperationError, OperationResult};
use crate::options::ReceiveOptions;
use crate::progress::{Progress, Stage};

/// Outcome of a successful receive.
#[derive(Clone, Debug)]
pub struct Received {
    pub root: Arc<Base>,
    /// Fragments decoded, root included.
    pub fragments: usize,
    pub from_cache: usize,
    pub downloaded: usize,
    /// Referenced ids found in no tier.
    pub absent: usize,
    pub blobs_downloaded: usize,
}

/// Rebuild the object `root_id` from `local`, falling back to `remote`.
///
/// Everything downloaded is written through to `local` before decoding
/// starts, so a second receive of the same object is served from the cache.
pub async fn receive(
    registry: Arc<TypeRegistry>,
    root_id: ObjectId,
    local: &Arc<dyn ObjectStore>,
    remote: Option<&Arc<dyn ObjectStore>>,
    options: &ReceiveOptions,
    cancel: &CancelToken,
    progress: &Progress,
) -> OperationResult<Received> {
    let result = run(registry, root_id, local, remote, options, cancel, progress).await;
    match result {
        Err(_) if cancel.is_canceled() => {
            progress.stop();
            Err(OperationError::Canceled)
        }
        Err(e) => {
            progress.stop();
            Err(e)
        }
        ok => ok,
    }
}

async fn run(
    registry: Arc<TypeRegistry>,
    root_id: ObjectId,
    local: &Arc<dyn ObjectStore>,
    remote: Option<&Arc<dyn ObjectStore>>,
    options: &ReceiveOptions,
    cancel: &CancelToken,
    progress: &Progress,
) -> OperationResult<Received> {
    let mut loader = Loader {
        local: local.as_ref(),
        remote: remote.map(|r| r.as_ref()),
        options,
        cancel,
        progress,
        from_cache: 0,
        downloaded: 0,
    };
    let mut set = FragmentSet::new();

    loader.load(&mut set, &[root_id]).await?;
    let closure = match set.get(&root_id) {
        Some(map) => BaseDeserializer::closure_of(Some(root_id), map)?,
        None => {
            return Err(OperationError::MissingReference {
                id: root_id,
                referenced_by: None,
            })
        }
    };
    debug!(root = %root_id, closure = closure.len(), "resolved closure");

    loader.load(&mut set, &closure.depth_order()).await?;
    loop {
        let unknown = set.unknown_references()?;
        if unknown.is_empty() {
            break;
        }
        debug!(count = unknown.len(), "fetching references missing from the closure");
        loader.load(&mut set, &unknown).await?;
    }
    cancel.check()?;
    local.flush().await?;

    let (from_cache, downloaded) = (loader.from_cache, loader.downloaded);
    let fragments = set.len();
    let absent = set.absent().len();
    if absent > 0 {
        warn!(absent, "some referenced objects were not found");
    }

    let deserializer = Arc::new(BaseDeserializer::new(registry, options.deserializer()));
    let root = decode(deserializer, Arc::new(set), root_id, options.decode_workers, cancel, progress).await?;

    let blobs_downloaded = match &options.blob_dir {
        Some(dir) => download_blobs(&root, dir, local.as_ref(), remote.map(|r| r.as_ref()), options, cancel, progress).await?,
        None => 0,
    };

    info!(root = %root_id, fragments, from_cache, downloaded, absent, "receive complete");
    Ok(Received {
        root,
        fragments,
        from_cache,
        downloaded,
        absent,
        blobs_downloaded,
    })
}

fn fragment_of(id: ObjectId, json: &str, map: &Map<String, Json>) -> Fragment {
    let speckle_type = map.get(wire::SPECKLE_TYPE).and_then(Json::as_str).unwrap_or_default();
    Fragment::new(id, json, speckle_type)
}

struct Loader<'a> {
    local: &'a dyn ObjectStore,
    remote: Option<&'a dyn ObjectStore>,
    options: &'a ReceiveOptions,
    cancel: &'a CancelToken,
    progress: &'a Progress,
    from_cache: usize,
    downloaded: usize,
}

impl Loader<'_> {
    /// Load `ids` into `set` from the local tier, then the remote one. Ids
    /// found in neither are marked absent.
    async fn load(&mut self, set: &mut FragmentSet, ids: &[ObjectId]) -> OperationResult<()> {
        let wanted: Vec<ObjectId> = ids.iter().filter(|id| !set.contains(id)).copied().collect();
        let mut missing = Vec::new();
        let mut checked = 0;
        for chunk in wanted.chunks(self.options.cache_check_batch_size.max(1)) {
            self.cancel.check()?;
            let found = self.local.get_batch(chunk).await?;
            for id in chunk {
                match found.get(id) {
                    Some(json) => set.insert_json(*id, json)?,
                    None => missing.push(*id),
                }
            }
            self.from_cache += found.len();
            checked += chunk.len();
            self.progress.report(Stage::CacheCheck, checked, Some(wanted.len()));
        }

        if missing.is_empty() {
            return Ok(());
        }
        match self.remote {
            Some(remote) => self.download(set, remote, &missing).await,
            None => {
                for id in missing {
                    set.mark_absent(id);
                }
                Ok(())
            }
        }
    }

    async fn download(&mut self, set: &mut FragmentSet, remote: &dyn ObjectStore, ids: &[ObjectId]) -> OperationResult<()> {
        let cancel = self.cancel;
        let mut chunks = stream::iter(ids.chunks(self.options.download_batch_size.max(1)))
            .map(|chunk| async move {
                cancel.check()?;
                let found = remote.get_batch(chunk).await?;
                Ok::<_, OperationError>((chunk, found))
            })
            .buffer_unordered(self.options.download_workers.max(1));

        let mut done = 0;
        while let Some(result) = chunks.next().await {
            let (chunk, found) = result?;
            let mut fragments = Vec::with_capacity(found.len());
            for id in chunk {
                match found.get(id) {
                    Some(json) => {
                        let map = BaseDeserializer::parse(Some(*id), json)?;
                        fragments.push(fragment_of(*id, json, &map));
                        set.insert(*id, map);
                    }
                    None => set.mark_absent(*id),
                }
            }
            self.cancel.check()?;
            if !fragments.is_empty() {
                self.local.put_batch(&fragments).await?;
            }
            self.downloaded += fragments.len();
            done += chunk.len();
            self.progress.report(Stage::Download, done, Some(ids.len()));
        }
        Ok(())
    }
}

struct DecodeJob {
    deserializer: Arc<BaseDeserializer>,
    set: Arc<FragmentSet>,
    cache: DecodeCache,
    queue: Mutex<VecDeque<ObjectId>>,
    remaining: AtomicUsize,
    total: usize,
    failed: AtomicBool,
    cancel: CancelToken,
    progress: Progress,
}

/// Decode every fragment of `set` on `workers` blocking threads.
///
/// Workers pull ids from a shared queue in dependency order. A fragment
/// whose children another worker is still decoding goes back to the end of
/// the queue instead of holding its worker.
async fn decode(
    deserializer: Arc<BaseDeserializer>,
    set: Arc<FragmentSet>,
    root_id: ObjectId,
    workers: usize,
    cancel: &CancelToken,
    progress: &Progress,
) -> OperationResult<Arc<Base>> {
    let order = set.dependency_order()?;
    let cache = DecodeCache::new();
    for id in set.absent() {
        cache.mark_absent(*id);
    }
    let job = Arc::new(DecodeJob {
        deserializer,
        total: order.len(),
        remaining: AtomicUsize::new(order.len()),
        queue: Mutex::new(order.into()),
        set,
        cache,
        failed: AtomicBool::new(false),
        cancel: cancel.clone(),
        progress: progress.clone(),
    });

    let mut tasks = JoinSet::new();
    for _ in 0..workers.max(1) {
        let job = job.clone();
        tasks.spawn_blocking(move || {
            let result = decode_worker(&job);
            if result.is_err() {
                job.failed.store(true, Ordering::SeqCst);
                job.progress.stop();
            }
            result
        });
    }

    let mut failure: Option<OperationError> = None;
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined.map_err(OperationError::from).and_then(|r| r) {
            job.failed.store(true, Ordering::SeqCst);
            job.progress.stop();
            if failure.as_ref().map_or(true, OperationError::is_canceled) {
                failure = Some(e);
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    job.cache
        .take(&root_id)
        .ok_or_else(|| OperationError::Worker(format!("root {root_id} was not decoded")))
}

fn decode_worker(job: &DecodeJob) -> OperationResult<()> {
    loop {
        if job.failed.load(Ordering::SeqCst) {
            return Ok(());
        }
        job.cancel.check()?;

        let next = job.queue.lock().pop_front();
        let Some(id) = next else {
            if job.remaining.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            // Others are still decoding what the queue is waiting for.
            std::thread::sleep(Duration::from_millis(1));
            continue;
        };
        if !job.cache.try_claim(id) {
            continue;
        }
        let Some(map) = job.set.get(&id) else {
            job.cache.release(id);
            job.failed.store(true, Ordering::SeqCst);
            return Err(OperationError::Worker(format!("fragment {id} vanished from the decode set")));
        };

        match job.deserializer.decode_step(id, map, &job.cache) {
            Ok(DecodeStep::Ready(base)) => {
                job.cache.complete(id, base);
                let left = job.remaining.fetch_sub(1, Ordering::SeqCst) - 1;
                job.progress.report(Stage::Deserialize, job.total - left, Some(job.total));
            }
            Ok(DecodeStep::Blocked(_)) => {
                job.cache.release(id);
                job.queue.lock().push_back(id);
                std::thread::yield_now();
            }
            Err(e) => {
                job.cache.release(id);
                job.failed.store(true, Ordering::SeqCst);
                return Err(e.into());
            }
        }
    }
}

/// Every blob reachable from `root`, each once.
fn collect_blobs(root: &Arc<Base>) -> Vec<Arc<Base>> {
    fn push_objects(value: &Value, stack: &mut Vec<Arc<Base>>) {
        match value {
            Value::Object(base) => stack.push(base.clone()),
            Value::List(items) => items.iter().for_each(|v| push_objects(v, stack)),
            Value::Map(entries) => entries.values().for_each(|v| push_objects(v, stack)),
            _ => {}
        }
    }

    let mut seen = HashSet::new();
    let mut found = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(base) = stack.pop() {
        if !seen.insert(Arc::as_ptr(&base)) {
            continue;
        }
        if builtins::is_blob(&base) {
            found.push(base.clone());
        }
        for member in base.members() {
            push_objects(&member.value, &mut stack);
        }
    }
    found
}

/// Copy the file of every blob under `root` into `dir` and point the blob at
/// the copy.
async fn download_blobs(
    root: &Arc<Base>,
    dir: &Path,
    local: &dyn ObjectStore,
    remote: Option<&dyn ObjectStore>,
    options: &ReceiveOptions,
    cancel: &CancelToken,
    progress: &Progress,
) -> OperationResult<usize> {
    let blobs = collect_blobs(root);
    if blobs.is_empty() {
        return Ok(0);
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| TransportError::io("blobs", e))?;

    let sources: Vec<&dyn BlobStore> = std::iter::once(local)
        .chain(remote)
        .filter_map(|store| store.blobs())
        .collect();
    let mut downloaded = 0;
    for blob in &blobs {
        cancel.check()?;
        let Some(id) = blob.id() else {
            continue;
        };
        let name = blob
            .get(builtins::BLOB_ORIGINAL_NAME)
            .and_then(|v| v.as_str().and_then(|n| Path::new(n).file_name()).map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "blob".to_string());
        let dest = dir.join(format!("{}-{name}", id.short_hex()));

        let mut found = false;
        for source in &sources {
            if source.get_blob(&id, &dest).await? {
                found = true;
                break;
            }
        }
        if !found {
            match options.missing_references {
                MissingReferencePolicy::Strict => {
                    return Err(OperationError::MissingReference {
                        id,
                        referenced_by: root.id(),
                    })
                }
                MissingReferencePolicy::Tolerant => {
                    warn!(blob = %id, "blob not found in any tier");
                    continue;
                }
            }
        }

        blob.set_unchecked(builtins::BLOB_FILE_PATH, Value::String(dest.display().to_string()));
        blob.set_id(id);
        downloaded += 1;
        progress.report(Stage::BlobDownload, downloaded, Some(blobs.len()));
    }
    Ok(downloaded)
}
