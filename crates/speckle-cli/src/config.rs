use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use speckle_pipeline::{ReceiveOptions, SendOptions};
use speckle_remote::{Account, RemoteConfig};
use speckle_server::ServerConfig;
use speckle_transport::{SqliteConfig, SqliteStore};

use crate::cli::EndpointArgs;

/// Contents of the `--config` TOML file. Every section is optional.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub account: Option<Account>,
    pub stream: Option<String>,
    pub cache: CacheConfig,
    pub remote: RemoteConfig,
    pub send: SendOptions,
    pub receive: ReceiveOptions,
    pub server: ServerConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Database file. Defaults to `<scope>.db` under the user data directory.
    pub path: Option<PathBuf>,
    pub scope: String,
    pub sqlite: SqliteConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            scope: "Objects".to_string(),
            sqlite: SqliteConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn resolved_path(&self) -> anyhow::Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => SqliteStore::default_path(&self.scope).context("no default cache location"),
        }
    }
}

impl CliConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply command-line endpoint flags on top of the file values.
    pub fn apply(&mut self, endpoint: &EndpointArgs) {
        if let Some(server) = &endpoint.server {
            let token = self.account.take().and_then(|a| a.token);
            self.account = Some(Account::new(server.clone(), token));
        }
        if let Some(token) = &endpoint.token {
            if let Some(account) = self.account.as_mut() {
                account.token = Some(token.clone());
            }
        }
        if let Some(stream) = &endpoint.stream {
            self.stream = Some(stream.clone());
        }
        if let Some(cache) = &endpoint.cache {
            self.cache.path = Some(cache.clone());
        }
        if endpoint.no_cache {
            self.cache.enabled = false;
        }
    }
}
