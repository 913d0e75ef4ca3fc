//! HTTP tier of the Speckle object store.
//!
//! [`ServerTransport`] implements [`ObjectStore`](speckle_transport::ObjectStore)
//! and [`BlobStore`](speckle_transport::BlobStore) against one stream on an
//! object server. The request and response shapes it speaks are in [`api`],
//! shared with the reference server in `speckle-server`.

pub mod account;
pub mod api;
pub mod client;
pub mod config;

pub use account::{Account, AccountError};
pub use client::ServerTransport;
pub use config::RemoteConfig;
