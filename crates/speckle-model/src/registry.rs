use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use speckle_types::wire;
use tracing::debug;

use crate::base::Base;
use crate::builtins;
use crate::schema::TypeSchema;

/// Maps wire discriminators to schemas.
///
/// A registry is built once per process (or per test) and passed to whoever
/// decodes objects. Resolution tries the exact discriminator, then each
/// segment of an inheritance chain from most to least derived, then falls
/// back to the generic schema.
pub struct TypeRegistry {
    schemas: RwLock<HashMap<String, Arc<TypeSchema>>>,
    generic: Arc<TypeSchema>,
}

impl TypeRegistry {
    /// An empty registry that only knows the generic schema.
    pub fn new() -> Self {
        let generic = Arc::new(TypeSchema::base());
        let mut schemas = HashMap::new();
        schemas.insert(generic.speckle_type().to_string(), generic.clone());
        Self {
            schemas: RwLock::new(schemas),
            generic,
        }
    }

    /// A registry that also knows chunks and blobs.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(builtins::data_chunk_schema());
        registry.register(builtins::blob_schema());
        registry
    }

    /// Register a schema under its full discriminator and, for chained
    /// types, under its most derived segment as well.
    pub fn register(&self, schema: TypeSchema) -> Arc<TypeSchema> {
        let schema = Arc::new(schema);
        let mut schemas = self.schemas.write();
        schemas.insert(schema.speckle_type().to_string(), schema.clone());
        if let Some(last) = schema.chain().last() {
            if last != schema.speckle_type() {
                schemas.insert(last.to_string(), schema.clone());
            }
        }
        debug!(speckle_type = schema.speckle_type(), "registered schema");
        schema
    }

    pub fn get(&self, speckle_type: &str) -> Option<Arc<TypeSchema>> {
        self.schemas.read().get(speckle_type).cloned()
    }

    pub fn generic(&self) -> &Arc<TypeSchema> {
        &self.generic
    }

    /// Best schema for a wire discriminator.
    pub fn resolve(&self, speckle_type: &str) -> Arc<TypeSchema> {
        let schemas = self.schemas.read();
        if let Some(schema) = schemas.get(speckle_type) {
            return schema.clone();
        }
        speckle_type
            .rsplit(wire::TYPE_CHAIN_SEPARATOR)
            .find_map(|segment| schemas.get(segment).cloned())
            .unwrap_or_else(|| self.generic.clone())
    }

    /// A fresh object for a wire discriminator, keeping the discriminator
    /// even when a less derived schema was chosen.
    pub fn create(&self, speckle_type: &str) -> Base {
        Base::with_type(self.resolve(speckle_type), speckle_type)
    }

    /// The registered chunk schema, or the built-in one.
    pub fn data_chunk(&self) -> Arc<TypeSchema> {
        self.get(wire::DATA_CHUNK_TYPE)
            .unwrap_or_else(|| Arc::new(builtins::data_chunk_schema()))
    }

    /// The registered blob schema, or the built-in one.
    pub fn blob(&self) -> Arc<TypeSchema> {
        self.get(wire::BLOB_TYPE)
            .unwrap_or_else(|| Arc::new(builtins::blob_schema()))
    }

    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("schema_count", &self.len())
            .finish()
    }
}
