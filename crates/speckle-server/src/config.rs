use std::net::{Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// When set, every request except ping must carry `Bearer <token>`.
    pub required_token: Option<String>,
    /// Largest accepted request body.
    pub max_upload_bytes: usize,
    /// Reject uploaded fragments and blobs whose content does not hash to
    /// their id.
    pub verify_uploads: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 3000)),
            required_token: None,
            max_upload_bytes: 100 * 1024 * 1024,
            verify_uploads: true,
        }
    }
}
