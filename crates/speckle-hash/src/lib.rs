//! Content hashing for the Speckle object store.
//!
//! A fragment id is the SHA-256 digest of the fragment's canonical JSON body,
//! truncated to its first 32 hex characters. Canonical means object keys are
//! written in sorted order with no insignificant whitespace, so the same
//! logical content always hashes the same regardless of how it was built.
//!
//! Blob ids use the same digest over raw file bytes.

pub mod canonical;
pub mod hasher;

pub use canonical::{to_canonical_string, to_hash_string, write_canonical, write_canonical_object};
pub use hasher::{ContentHasher, HasherError};
