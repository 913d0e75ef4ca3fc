use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Phase of a send or receive that progress is reported for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Serialize,
    CacheCheck,
    Download,
    Upload,
    Deserialize,
    BlobUpload,
    BlobDownload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Serialize => "serialize",
            Stage::CacheCheck => "cache_check",
            Stage::Download => "download",
            Stage::Upload => "upload",
            Stage::Deserialize => "deserialize",
            Stage::BlobUpload => "blob_upload",
            Stage::BlobDownload => "blob_download",
        };
        f.write_str(name)
    }
}

/// One progress tick. `count` is cumulative within the stage; `total` is
/// known only once the stage's size is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub count: usize,
    pub total: Option<usize>,
}

type Callback = dyn Fn(ProgressEvent) + Send + Sync;

/// Progress sink shared by the tasks of one operation.
///
/// Once [`stop`](Self::stop) is called, typically because the operation
/// failed, no further events reach the callback.
#[derive(Clone, Default)]
pub struct Progress {
    callback: Option<Arc<Callback>>,
    stopped: Arc<AtomicBool>,
}

impl Progress {
    pub fn new(callback: impl Fn(ProgressEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A reporter that drops every event.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn report(&self, stage: Stage, count: usize, total: Option<usize>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Some(callback) = &self.callback {
            callback(ProgressEvent { stage, count, total });
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("callback", &self.callback.is_some())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
