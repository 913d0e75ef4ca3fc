//! Object model of the Speckle object store.
//!
//! A [`Base`] is a property bag with typed fields declared by a
//! [`TypeSchema`] and arbitrary dynamic fields added at runtime. Every field
//! has a [`FieldRole`] deciding whether the serializer inlines it, detaches it
//! into its own fragment, chunks it, or skips it. Schemas are registered once
//! in a [`TypeRegistry`] that decoders consult to turn wire discriminators
//! back into typed objects.
//!
//! # Dynamic names
//!
//! - `__name` -- ignored
//! - `@name` -- detached
//! - `@(N)name` -- detached and chunked by `N`

pub mod base;
pub mod builtins;
pub mod error;
pub mod names;
pub mod registry;
pub mod schema;
pub mod value;

pub use base::{Base, Member};
pub use error::{ModelError, ModelResult};
pub use registry::TypeRegistry;
pub use schema::{FieldDescriptor, FieldRole, FieldType, TypeSchema, TypeSchemaBuilder};
pub use value::Value;
