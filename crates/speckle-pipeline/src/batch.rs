use std::time::Duration;

use speckle_types::Fragment;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::error::{OperationError, OperationResult};

/// Bounds on one batch.
#[derive(Clone, Copy, Debug)]
pub struct BatchLimits {
    pub max_items: usize,
    pub max_bytes: usize,
    pub idle: Duration,
}

/// Groups a fragment stream into batches bounded by count and size.
///
/// A batch is released when it is full, when adding the next fragment would
/// exceed `max_bytes`, when no fragment arrived for `idle`, or when the
/// stream ends. The fragment that did not fit opens the next batch, so a
/// fragment larger than `max_bytes` travels alone.
pub struct Batcher {
    rx: mpsc::Receiver<Fragment>,
    limits: BatchLimits,
    carry: Option<Fragment>,
    closed: bool,
}

impl Batcher {
    pub fn new(rx: mpsc::Receiver<Fragment>, limits: BatchLimits) -> Self {
        Self {
            rx,
            limits: BatchLimits {
                max_items: limits.max_items.max(1),
                ..limits
            },
            carry: None,
            closed: false,
        }
    }

    /// The next batch, or `None` once the stream is drained.
    pub async fn next(&mut self, cancel: &CancelToken) -> OperationResult<Option<Vec<Fragment>>> {
        let mut batch = Vec::new();
        let mut bytes = 0usize;
        if let Some(fragment) = self.carry.take() {
            bytes += fragment.size();
            batch.push(fragment);
        }

        loop {
            if batch.len() >= self.limits.max_items || bytes >= self.limits.max_bytes {
                return Ok(Some(batch));
            }
            if self.closed {
                return Ok((!batch.is_empty()).then_some(batch));
            }

            let received = if batch.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(OperationError::Canceled),
                    received = self.rx.recv() => received,
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(OperationError::Canceled),
                    received = tokio::time::timeout(self.limits.idle, self.rx.recv()) => match received {
                        Ok(received) => received,
                        Err(_) => return Ok(Some(batch)),
                    },
                }
            };

            match received {
                None => self.closed = true,
                Some(fragment) => {
                    if !batch.is_empty() && bytes + fragment.size() > self.limits.max_bytes {
                        self.carry = Some(fragment);
                        return Ok(Some(batch));
                    }
                    bytes += fragment.size();
                    batch.push(fragment);
                }
            }
        }
    }
}
