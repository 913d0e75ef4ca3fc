use serde::{Deserialize, Serialize};
use url::Url;

/// Errors in account or stream settings.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("invalid server url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid stream id {0:?}")]
    InvalidStream(String),
}

/// Where a server lives and how to authenticate against it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub server_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Account {
    pub fn new(server_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            server_url: server_url.into(),
            token,
        }
    }

    /// Parsed base url. Only `http` and `https` are accepted; a trailing
    /// slash is added so relative endpoints join under the base path.
    pub fn base_url(&self) -> Result<Url, AccountError> {
        let invalid = |reason: String| AccountError::InvalidUrl {
            url: self.server_url.clone(),
            reason,
        };
        let mut url = Url::parse(&self.server_url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme {}", url.scheme())));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("server_url", &self.server_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Stream ids become a single path segment.
pub fn validate_stream(stream: &str) -> Result<(), AccountError> {
    let ok = !stream.is_empty()
        && stream
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(AccountError::InvalidStream(stream.to_string()))
    }
}
