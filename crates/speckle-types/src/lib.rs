//! Foundation types for the Speckle content-addressed object store.
//!
//! Everything that crosses a crate boundary in the workspace is built from the
//! small vocabulary defined here:
//!
//! - [`ObjectId`] -- the 32-hex-character content id of a fragment
//! - [`Closure`] -- descendant id to minimum detach depth
//! - [`Fragment`] -- one content-addressed unit of stored JSON
//! - [`ObjectReference`] -- a placeholder standing in for a detached object
//!
//! The [`wire`] module holds the JSON field names and discriminators shared
//! by the serializer, the deserializer and the transports.

pub mod closure;
pub mod error;
pub mod fragment;
pub mod id;
pub mod reference;
pub mod wire;

pub use closure::Closure;
pub use error::TypeError;
pub use fragment::Fragment;
pub use id::ObjectId;
pub use reference::ObjectReference;
