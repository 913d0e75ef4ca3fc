//! Send and receive pipelines for Speckle object graphs.
//!
//! A send serializes a [`Base`](speckle_model::Base) graph on a blocking
//! thread, groups the fragments into size-bounded batches and uploads each
//! batch to every target after diffing it against what the target already
//! holds. A receive fetches the root, resolves its closure, loads what the
//! local tier has, downloads the rest in parallel, and decodes the graph
//! children first on a pool of workers.
//!
//! Both run under one [`CancelToken`] and report through [`Progress`]; the
//! first failure cancels every stage and is the error the caller sees.

pub mod batch;
pub mod cancel;
pub mod error;
pub mod operations;
pub mod options;
pub mod progress;
pub mod receive;
pub mod send;

pub use batch::{BatchLimits, Batcher};
pub use cancel::CancelToken;
pub use error::{OperationError, OperationResult};
pub use operations::Operations;
pub use options::{ReceiveOptions, SendOptions};
pub use progress::{Progress, ProgressEvent, Stage};
pub use receive::{receive, Received};
pub use send::{send, SendResult, TargetStats};
