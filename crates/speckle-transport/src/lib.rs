//! Storage tiers for content-addressed fragments.
//!
//! Every tier implements [`ObjectStore`]: get, put and batch existence checks
//! keyed by [`ObjectId`](speckle_types::ObjectId). Tiers that can also hold
//! file payloads expose a [`BlobStore`] through [`ObjectStore::blobs`].
//!
//! - [`MemoryStore`] -- process-local, for tests and hot caches
//! - [`DiskStore`] -- one file per fragment in a sharded directory
//! - [`SqliteStore`] -- one WAL database per application scope, with a
//!   batching background writer
//!
//! The HTTP server tier lives in `speckle-remote`.

pub mod disk;
pub mod error;
pub mod memory;
pub mod sqlite;
pub mod traits;

pub use disk::DiskStore;
pub use error::{TransportError, TransportResult};
pub use memory::MemoryStore;
pub use sqlite::{SqliteConfig, SqliteStore};
pub use traits::{BlobStore, ObjectStore};
