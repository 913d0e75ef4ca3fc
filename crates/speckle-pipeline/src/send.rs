//! Send path: serialize, batch, diff against each target, upload.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use speckle_codec::{BaseSerializer, BlobRef, FnSink, SerializeError, SerializeSummary};
use speckle_model::{Base, TypeRegistry};
use speckle_transport::ObjectStore;
use speckle_types::{Fragment, ObjectId, ObjectReference};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::batch::{BatchLimits, Batcher};
use crate::cancel::CancelToken;
use crate::error::{OperationError, OperationResult};
use crate::options::SendOptions;
use crate::progress::{Progress, Stage};

/// What one target received.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetStats {
    pub name: String,
    /// Fragments written to the target.
    pub uploaded: usize,
    /// Fragments the target already had.
    pub skipped: usize,
    pub blobs_uploaded: usize,
}

/// Outcome of a successful send.
#[derive(Clone, Debug)]
pub struct SendResult {
    pub root_id: ObjectId,
    /// `applicationId -> reference` of tracked detached children.
    pub tracked: BTreeMap<String, ObjectReference>,
    pub targets: Vec<TargetStats>,
    pub fragment_count: usize,
    pub total_bytes: usize,
}

#[derive(Default)]
struct Counters {
    uploaded: AtomicUsize,
    skipped: AtomicUsize,
}

enum TaskOutcome {
    Serialized(SerializeSummary),
    Done,
}

type BatchReceiver = Arc<AsyncMutex<mpsc::Receiver<Arc<Vec<Fragment>>>>>;

/// Serialize `root` and store its fragments in every target.
///
/// The serializer runs on a blocking thread and feeds a bounded queue, so it
/// stalls while the uploaders are behind. Batches are fanned out to every
/// target; each target diffs a batch before writing it. The first failure in
/// any stage cancels the rest, and the caller gets that failure rather than
/// the cancellations it caused.
pub async fn send(
    registry: &TypeRegistry,
    root: Arc<Base>,
    targets: &[Arc<dyn ObjectStore>],
    options: &SendOptions,
    cancel: &CancelToken,
    progress: &Progress,
) -> OperationResult<SendResult> {
    if targets.is_empty() {
        return Err(OperationError::NoTargets);
    }
    let result = run(registry, root, targets, options, cancel, progress).await;
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
    registry: &TypeRegistry,
    root: Arc<Base>,
    targets: &[Arc<dyn ObjectStore>],
    options: &SendOptions,
    cancel: &CancelToken,
    progress: &Progress,
) -> OperationResult<SendResult> {
    cancel.check()?;
    let stage = cancel.child();
    let mut tasks: JoinSet<OperationResult<TaskOutcome>> = JoinSet::new();
    let (fragment_tx, fragment_rx) = mpsc::channel::<Fragment>(options.queue_capacity.max(1));

    let serializer = BaseSerializer::with_registry(registry, options.serializer());
    let serializing = {
        let stage = stage.clone();
        let progress = progress.clone();
        tokio::task::spawn_blocking(move || {
            let mut emitted = 0usize;
            let mut sink = FnSink(|fragment: Fragment| {
                if stage.is_canceled() {
                    return Err(SerializeError::Canceled);
                }
                emitted += 1;
                progress.report(Stage::Serialize, emitted, None);
                // A closed queue means the downstream stages stopped.
                fragment_tx
                    .blocking_send(fragment)
                    .map_err(|_| SerializeError::Canceled)
            });
            serializer.serialize_into(&root, &mut sink)
        })
    };
    tasks.spawn(async move { Ok(TaskOutcome::Serialized(serializing.await??)) });

    let workers = options.upload_workers.max(1);
    let processed = Arc::new(AtomicUsize::new(0));
    let mut batch_txs = Vec::with_capacity(targets.len());
    let mut counters = Vec::with_capacity(targets.len());
    for target in targets {
        let (tx, rx) = mpsc::channel::<Arc<Vec<Fragment>>>(workers);
        let rx: BatchReceiver = Arc::new(AsyncMutex::new(rx));
        let counter = Arc::new(Counters::default());
        for _ in 0..workers {
            tasks.spawn(upload_worker(
                target.clone(),
                rx.clone(),
                counter.clone(),
                processed.clone(),
                stage.clone(),
                progress.clone(),
            ));
        }
        batch_txs.push(tx);
        counters.push(counter);
    }

    let limits = BatchLimits {
        max_items: options.batch_max_items,
        max_bytes: options.batch_max_bytes,
        idle: options.batch_idle_timeout(),
    };
    {
        let stage = stage.clone();
        tasks.spawn(async move {
            let mut batcher = Batcher::new(fragment_rx, limits);
            while let Some(batch) = batcher.next(&stage).await? {
                let batch = Arc::new(batch);
                for tx in &batch_txs {
                    tokio::select! {
                        _ = stage.cancelled() => return Err(OperationError::Canceled),
                        sent = tx.send(batch.clone()) => sent.map_err(|_| OperationError::Canceled)?,
                    }
                }
            }
            Ok(TaskOutcome::Done)
        });
    }

    let mut summary = None;
    let mut failure: Option<OperationError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.map_err(OperationError::from).and_then(|outcome| outcome) {
            Ok(TaskOutcome::Serialized(s)) => summary = Some(s),
            Ok(TaskOutcome::Done) => {}
            Err(e) => {
                progress.stop();
                stage.cancel();
                if failure.as_ref().map_or(true, OperationError::is_canceled) {
                    failure = Some(e);
                }
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    let summary = summary.ok_or_else(|| OperationError::Worker("serializer reported no result".into()))?;

    let mut blob_counts = vec![0usize; targets.len()];
    if !summary.blobs.is_empty() {
        for (count, target) in blob_counts.iter_mut().zip(targets) {
            *count = upload_blobs(target.as_ref(), &summary.blobs, cancel, progress).await?;
        }
    }

    for target in targets {
        cancel.check()?;
        target.flush().await?;
    }

    let stats: Vec<TargetStats> = targets
        .iter()
        .zip(&counters)
        .zip(blob_counts)
        .map(|((target, counter), blobs_uploaded)| TargetStats {
            name: target.name().to_string(),
            uploaded: counter.uploaded.load(Ordering::Relaxed),
            skipped: counter.skipped.load(Ordering::Relaxed),
            blobs_uploaded,
        })
        .collect();

    for s in &stats {
        info!(store = %s.name, uploaded = s.uploaded, skipped = s.skipped, blobs = s.blobs_uploaded, "target updated");
    }
    info!(
        root = %summary.root_id,
        fragments = summary.fragment_count,
        bytes = summary.total_bytes,
        "send complete"
    );

    Ok(SendResult {
        root_id: summary.root_id,
        tracked: summary.tracked,
        targets: stats,
        fragment_count: summary.fragment_count,
        total_bytes: summary.total_bytes,
    })
}

/// Drain batches for one target. A failing worker silences progress and
/// cancels its siblings before its error is joined.
async fn upload_worker(
    target: Arc<dyn ObjectStore>,
    batches: BatchReceiver,
    counters: Arc<Counters>,
    processed: Arc<AtomicUsize>,
    cancel: CancelToken,
    progress: Progress,
) -> OperationResult<TaskOutcome> {
    let result = upload_batches(target, batches, counters, processed, &cancel, &progress).await;
    if result.is_err() {
        progress.stop();
        cancel.cancel();
    }
    result
}

async fn upload_batches(
    target: Arc<dyn ObjectStore>,
    batches: BatchReceiver,
    counters: Arc<Counters>,
    processed: Arc<AtomicUsize>,
    cancel: &CancelToken,
    progress: &Progress,
) -> OperationResult<TaskOutcome> {
    loop {
        let next = {
            let mut batches = batches.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => return Err(OperationError::Canceled),
                next = batches.recv() => next,
            }
        };
        let Some(batch) = next else {
            return Ok(TaskOutcome::Done);
        };

        cancel.check()?;
        let ids: Vec<ObjectId> = batch.iter().map(|f| f.id).collect();
        let missing: HashSet<ObjectId> = target.missing(&ids).await?.into_iter().collect();
        let fresh: Vec<Fragment> = batch
            .iter()
            .filter(|f| missing.contains(&f.id))
            .cloned()
            .collect();

        cancel.check()?;
        if !fresh.is_empty() {
            target.put_batch(&fresh).await?;
        }
        // Writes that finish after a failure elsewhere are abandoned.
        cancel.check()?;
        let skipped = batch.len() - fresh.len();
        counters.uploaded.fetch_add(fresh.len(), Ordering::Relaxed);
        counters.skipped.fetch_add(skipped, Ordering::Relaxed);
        debug!(store = target.name(), uploaded = fresh.len(), skipped, "batch stored");

        let done = processed.fetch_add(batch.len(), Ordering::Relaxed) + batch.len();
        progress.report(Stage::Upload, done, None);
    }
}

async fn upload_blobs(
    target: &dyn ObjectStore,
    blobs: &[BlobRef],
    cancel: &CancelToken,
    progress: &Progress,
) -> OperationResult<usize> {
    let Some(store) = target.blobs() else {
        warn!(store = target.name(), count = blobs.len(), "target does not store blobs; skipping them");
        return Ok(0);
    };
    cancel.check()?;
    let ids: Vec<ObjectId> = blobs.iter().map(|b| b.id).collect();
    let missing: HashSet<ObjectId> = store.missing_blobs(&ids).await?.into_iter().collect();

    let mut uploaded = 0;
    for blob in blobs.iter().filter(|b| missing.contains(&b.id)) {
        cancel.check()?;
        store.put_blob(blob.id, &blob.path).await?;
        uploaded += 1;
        progress.report(Stage::BlobUpload, uploaded, Some(missing.len()));
    }
    Ok(uploaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use speckle_model::{builtins, Value};
    use speckle_transport::{MemoryStore, TransportError, TransportResult};

    fn graph(children: usize) -> Arc<Base> {
        let root = Base::dynamic().with("name", "root").unwrap();
        for i in 0..children {
            let child = Base::dynamic().with("i", i as i64).unwrap();
            root.set(&format!("@c{i}"), child).unwrap();
        }
        Arc::new(root)
    }

    fn stores(n: usize) -> (Vec<Arc<MemoryStore>>, Vec<Arc<dyn ObjectStore>>) {
        let concrete: Vec<Arc<MemoryStore>> = (0..n).map(|i| Arc::new(MemoryStore::named(format!("m{i}")))).collect();
        let dynamic = concrete.iter().map(|s| s.clone() as Arc<dyn ObjectStore>).collect();
        (concrete, dynamic)
    }

    async fn send_to(root: Arc<Base>, targets: &[Arc<dyn ObjectStore>], options: &SendOptions) -> OperationResult<SendResult> {
        let registry = TypeRegistry::with_builtins();
        send(&registry, root, targets, options, &CancelToken::new(), &Progress::none()).await
    }

    /// Fails every write, or cancels the given token on the first one.
    struct Faulty {
        inner: MemoryStore,
        cancel: Option<CancelToken>,
    }

    #[async_trait]
    impl ObjectStore for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }

        async fn get(&self, id: &ObjectId) -> TransportResult<Option<String>> {
            self.inner.get(id).await
        }

        async fn put_batch(&self, fragments: &[Fragment]) -> TransportResult<()> {
            match &self.cancel {
                Some(token) => {
                    token.cancel();
                    self.inner.put_batch(fragments).await
                }
                None => Err(TransportError::database("faulty", "disk full")),
            }
        }
    }

    // ----- Uploading -----

    #[tokio::test(flavor = "multi_thread")]
    async fn stores_every_fragment() {
        let root = graph(5);
        let expected = BaseSerializer::default().serialize(&root).unwrap();
        let (concrete, targets) = stores(1);

        let result = send_to(root, &targets, &SendOptions::default()).await.unwrap();
        assert_eq!(result.root_id, expected.root_id());
        assert_eq!(result.fragment_count, 6);
        assert_eq!(concrete[0].len(), 6);
        assert_eq!(
            result.targets,
            vec![TargetStats {
                name: "m0".into(),
                uploaded: 6,
                skipped: 0,
                blobs_uploaded: 0,
            }]
        );
        for fragment in expected.fragments() {
            assert_eq!(concrete[0].get(&fragment.id).await.unwrap().as_deref(), Some(fragment.json.as_str()));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_send_uploads_nothing() {
        let (concrete, targets) = stores(1);
        send_to(graph(8), &targets, &SendOptions::default()).await.unwrap();
        let written = concrete[0].written();

        let again = send_to(graph(8), &targets, &SendOptions::default()).await.unwrap();
        assert_eq!(again.targets[0].uploaded, 0);
        assert_eq!(again.targets[0].skipped, 9);
        assert_eq!(concrete[0].written(), written);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn targets_are_diffed_independently() {
        let (concrete, targets) = stores(2);
        send_to(graph(3), &targets[..1], &SendOptions::default()).await.unwrap();

        let result = send_to(graph(4), &targets, &SendOptions::default()).await.unwrap();
        // graph(4) shares three children with graph(3); its root differs.
        assert_eq!((result.targets[0].uploaded, result.targets[0].skipped), (2, 3));
        assert_eq!((result.targets[1].uploaded, result.targets[1].skipped), (5, 0));
        assert_eq!(concrete[1].len(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tiny_batches_and_many_workers() {
        let (concrete, targets) = stores(1);
        let options = SendOptions {
            queue_capacity: 1,
            batch_max_items: 1,
            upload_workers: 8,
            ..SendOptions::default()
        };
        let result = send_to(graph(40), &targets, &options).await.unwrap();
        assert_eq!(result.targets[0].uploaded, 41);
        assert_eq!(concrete[0].len(), 41);
    }

    #[tokio::test]
    async fn tracked_children_are_reported() {
        let child = Base::dynamic().with("v", 1).unwrap();
        child.set_application_id(Some("wall-1".into()));
        let root = Arc::new(Base::dynamic().with("@wall", child).unwrap());
        let (_concrete, targets) = stores(1);
        let options = SendOptions {
            track_detached_children: true,
            ..SendOptions::default()
        };
        let result = send_to(root, &targets, &options).await.unwrap();
        assert!(result.tracked.contains_key("wall-1"));
    }

    #[tokio::test]
    async fn blobs_follow_the_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ifc");
        std::fs::write(&path, b"ISO-10303-21;").unwrap();
        let registry = TypeRegistry::with_builtins();
        let root = Arc::new(Base::dynamic().with("@file", builtins::blob(&registry.blob(), &path)).unwrap());

        let (concrete, targets) = stores(1);
        let result = send(&registry, root.clone(), &targets, &SendOptions::default(), &CancelToken::new(), &Progress::none())
            .await
            .unwrap();
        assert_eq!(result.targets[0].blobs_uploaded, 1);
        assert_eq!(concrete[0].blob_count(), 1);

        let again = send(&registry, root, &targets, &SendOptions::default(), &CancelToken::new(), &Progress::none())
            .await
            .unwrap();
        assert_eq!(again.targets[0].blobs_uploaded, 0);
    }

    #[tokio::test]
    async fn progress_counts_fragments() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let progress = {
            let seen = seen.clone();
            Progress::new(move |e| seen.lock().push(e))
        };
        let (_concrete, targets) = stores(1);
        let registry = TypeRegistry::with_builtins();
        send(&registry, graph(3), &targets, &SendOptions::default(), &CancelToken::new(), &progress)
            .await
            .unwrap();

        let seen = seen.lock();
        let last = |stage| seen.iter().filter(|e| e.stage == stage).map(|e| e.count).max();
        assert_eq!(last(Stage::Serialize), Some(4));
        assert_eq!(last(Stage::Upload), Some(4));
    }

    // ----- Failures -----

    #[tokio::test]
    async fn no_targets() {
        assert!(matches!(
            send_to(graph(1), &[], &SendOptions::default()).await,
            Err(OperationError::NoTargets)
        ));
    }

    #[tokio::test]
    async fn cycles_fail_the_send() {
        let obj = Arc::new(Base::dynamic());
        obj.set("@self", Value::Object(obj.clone())).unwrap();
        let (concrete, targets) = stores(1);
        let err = send_to(obj.clone(), &targets, &SendOptions::default()).await.unwrap_err();
        assert!(matches!(err, OperationError::Serialization(SerializeError::Cycle { .. })));
        assert!(concrete[0].is_empty());
        obj.remove("@self");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_failures_are_terminal() {
        let target: Arc<dyn ObjectStore> = Arc::new(Faulty {
            inner: MemoryStore::new(),
            cancel: None,
        });
        let progress = Progress::new(|_| {});
        let registry = TypeRegistry::with_builtins();
        let err = send(&registry, graph(20), &[target], &SendOptions::default(), &CancelToken::new(), &progress)
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Transport(TransportError::Database { .. })), "{err}");
        assert!(progress.is_stopped());
    }

    /// First write fails quickly; later writes succeed slowly.
    struct SlowFaulty {
        inner: MemoryStore,
        calls: AtomicUsize,
        failed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl ObjectStore for SlowFaulty {
        fn name(&self) -> &str {
            "slow-faulty"
        }

        async fn get(&self, id: &ObjectId) -> TransportResult<Option<String>> {
            self.inner.get(id).await
        }

        async fn put_batch(&self, fragments: &[Fragment]) -> TransportResult<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                self.failed.store(true, Ordering::SeqCst);
                return Err(TransportError::database("slow-faulty", "disk full"));
            }
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            self.inner.put_batch(fragments).await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn no_progress_after_a_failed_upload() {
        let failed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let target: Arc<dyn ObjectStore> = Arc::new(SlowFaulty {
            inner: MemoryStore::new(),
            calls: AtomicUsize::new(0),
            failed: failed.clone(),
        });
        let late = Arc::new(Mutex::new(Vec::new()));
        let progress = {
            let late = late.clone();
            let failed = failed.clone();
            Progress::new(move |e| {
                if failed.load(Ordering::SeqCst) {
                    late.lock().push(e);
                }
            })
        };
        let options = SendOptions {
            batch_max_items: 1,
            upload_workers: 4,
            ..SendOptions::default()
        };
        let registry = TypeRegistry::with_builtins();
        let err = send(&registry, graph(8), &[target], &options, &CancelToken::new(), &progress)
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Transport(TransportError::Database { .. })), "{err}");
        assert!(late.lock().is_empty(), "events after failure: {:?}", late.lock());
    }

    #[tokio::test]
    async fn canceled_before_start() {
        let (concrete, targets) = stores(1);
        let cancel = CancelToken::new();
        cancel.cancel();
        let registry = TypeRegistry::with_builtins();
        let err = send(&registry, graph(2), &targets, &SendOptions::default(), &cancel, &Progress::none())
            .await
            .unwrap_err();
        assert!(err.is_canceled());
        assert!(concrete[0].is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn canceled_mid_upload() {
        let cancel = CancelToken::new();
        let target: Arc<dyn ObjectStore> = Arc::new(Faulty {
            inner: MemoryStore::new(),
            cancel: Some(cancel.clone()),
        });
        let options = SendOptions {
            batch_max_items: 1,
            upload_workers: 1,
            ..SendOptions::default()
        };
        let registry = TypeRegistry::with_builtins();
        let err = send(&registry, graph(50), &[target], &options, &cancel, &Progress::none())
            .await
            .unwrap_err();
        assert!(err.is_canceled());
    }
}
