use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for talking to an object server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Extra attempts after a transient failure.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further attempt.
    pub retry_backoff_ms: u64,
    pub timeout_secs: u64,
    /// Requests in flight at once, also the idle pool size per host.
    pub max_connections: usize,
    pub gzip_uploads: bool,
    /// Ids per `getobjects` or `diff` request.
    pub max_ids_per_request: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 200,
            timeout_secs: 60,
            max_connections: 4,
            gzip_uploads: true,
            max_ids_per_request: 500,
        }
    }
}

impl RemoteConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff() * 2u32.saturating_pow(attempt.saturating_sub(1)).min(64)
    }
}
