use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use speckle_types::wire;

use crate::error::{ModelError, ModelResult};
use crate::value::Value;

/// How a property takes part in serialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum FieldRole {
    /// Written inline into the owning fragment.
    Plain,
    /// Nested objects are written as separate fragments behind references.
    Detached,
    /// Detached, and lists are sliced into chunks of `chunk_size` elements.
    Chunked { chunk_size: usize },
    /// Neither written nor hashed.
    Ignored,
}

impl FieldRole {
    pub fn is_detached(&self) -> bool {
        matches!(self, FieldRole::Detached | FieldRole::Chunked { .. })
    }
}

/// Declared type of a schema field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Any,
    Bool,
    Int,
    Float,
    String,
    Timestamp,
    Enum,
    Matrix,
    List,
    Map,
    Object,
}

impl FieldType {
    /// Whether `value` may be stored in a field of this type. `Null` is
    /// accepted everywhere.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (FieldType::Any, _) => true,
            (FieldType::Bool, Value::Bool(_)) => true,
            (FieldType::Int, Value::Int(_)) => true,
            (FieldType::Float, Value::Float(_) | Value::Int(_)) => true,
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Timestamp, Value::Timestamp(_)) => true,
            (FieldType::Enum, Value::Enum(_) | Value::Int(_)) => true,
            (FieldType::Matrix, Value::Matrix(_)) => true,
            (FieldType::List, Value::List(_)) => true,
            (FieldType::Map, Value::Map(_)) => true,
            (FieldType::Object, Value::Object(_) | Value::Reference(_)) => true,
            _ => false,
        }
    }

    /// Value a field of this type holds before anything is assigned.
    pub fn default_value(&self) -> Value {
        match self {
            FieldType::Bool => Value::Bool(false),
            FieldType::Int => Value::Int(0),
            FieldType::Float => Value::Float(0.0),
            FieldType::String => Value::String(String::new()),
            FieldType::Enum => Value::Enum(0),
            FieldType::List => Value::List(Vec::new()),
            FieldType::Map => Value::Map(Default::default()),
            FieldType::Any | FieldType::Timestamp | FieldType::Matrix | FieldType::Object => {
                Value::Null
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Any => "any",
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Timestamp => "timestamp",
            FieldType::Enum => "enum",
            FieldType::Matrix => "matrix",
            FieldType::List => "list",
            FieldType::Map => "map",
            FieldType::Object => "object",
        }
    }
}

/// One typed member of a schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: FieldType,
    pub role: FieldRole,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, ty: FieldType, role: FieldRole) -> Self {
        Self {
            name: name.into(),
            ty,
            role,
        }
    }
}

/// Static field table of one concrete type, built once at registration.
#[derive(Debug)]
pub struct TypeSchema {
    speckle_type: String,
    fields: Vec<FieldDescriptor>,
    index: HashMap<String, usize>,
}

impl TypeSchema {
    /// The generic schema with no typed fields.
    pub fn base() -> Self {
        Self {
            speckle_type: wire::BASE_TYPE.to_string(),
            fields: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn builder(name: impl Into<String>) -> TypeSchemaBuilder {
        TypeSchemaBuilder::new(name)
    }

    /// Full discriminator, including the inheritance chain.
    pub fn speckle_type(&self) -> &str {
        &self.speckle_type
    }

    /// Chain segments from least to most derived.
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        self.speckle_type.split(wire::TYPE_CHAIN_SEPARATOR)
    }

    pub fn is_generic(&self) -> bool {
        self.speckle_type == wire::BASE_TYPE
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.index.get(name).map(|&i| &self.fields[i])
    }
}

/// Builder for [`TypeSchema`].
///
/// ```
/// use speckle_model::{FieldType, TypeSchema};
///
/// let point = TypeSchema::builder("Objects.Geometry.Point")
///     .field("x", FieldType::Float)
///     .field("y", FieldType::Float)
///     .build()
///     .unwrap();
/// assert_eq!(point.fields().len(), 2);
/// ```
#[derive(Debug)]
pub struct TypeSchemaBuilder {
    name: String,
    parent: Option<Arc<TypeSchema>>,
    fields: Vec<FieldDescriptor>,
}

impl TypeSchemaBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            fields: Vec::new(),
        }
    }

    /// Inherit the parent's fields. The resulting discriminator is
    /// `parent:name`.
    pub fn extends(mut self, parent: Arc<TypeSchema>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn field(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.with_role(name, ty, FieldRole::Plain)
    }

    pub fn detached(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.with_role(name, ty, FieldRole::Detached)
    }

    pub fn chunked(self, name: impl Into<String>, chunk_size: usize) -> Self {
        self.with_role(name, FieldType::List, FieldRole::Chunked { chunk_size })
    }

    pub fn ignored(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.with_role(name, ty, FieldRole::Ignored)
    }

    pub fn with_role(mut self, name: impl Into<String>, ty: FieldType, role: FieldRole) -> Self {
        self.fields.push(FieldDescriptor::new(name, ty, role));
        self
    }

    pub fn build(self) -> ModelResult<TypeSchema> {
        if self.name.is_empty()
            || self.name.contains(wire::TYPE_CHAIN_SEPARATOR)
            || self.name.chars().any(char::is_whitespace)
        {
            return Err(ModelError::InvalidTypeName(self.name));
        }

        let (speckle_type, mut fields) = match &self.parent {
            Some(parent) if !parent.is_generic() => (
                format!("{}{}{}", parent.speckle_type(), wire::TYPE_CHAIN_SEPARATOR, self.name),
                parent.fields().to_vec(),
            ),
            Some(parent) => (self.name.clone(), parent.fields().to_vec()),
            None => (self.name.clone(), Vec::new()),
        };
        let inherited = fields.len();

        for field in self.fields {
            if field.name.is_empty() || wire::is_reserved(&field.name) {
                return Err(ModelError::ReservedName(field.name));
            }
            if let FieldRole::Chunked { chunk_size: 0 } = field.role {
                return Err(ModelError::InvalidChunkSize { field: field.name });
            }
            match fields.iter().position(|f| f.name == field.name) {
                // A subtype may redeclare an inherited field.
                Some(i) if i < inherited => fields[i] = field,
                Some(_) => {
                    return Err(ModelError::DuplicateField {
                        speckle_type,
                        field: field.name,
                    })
                }
                None => fields.push(field),
            }
        }

        let index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Ok(TypeSchema {
            speckle_type,
            fields,
            index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point() -> Arc<TypeSchema> {
        Arc::new(
            TypeSchema::builder("Objects.Geometry.Point")
                .field("x", FieldType::Float)
                .field("y", FieldType::Float)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn builder_indexes_fields() {
        let schema = point();
        assert_eq!(schema.speckle_type(), "Objects.Geometry.Point");
        assert_eq!(schema.field("x").unwrap().ty, FieldType::Float);
        assert!(schema.field("z").is_none());
    }

    #[test]
    fn extends_builds_chain_and_inherits() {
        let child = TypeSchema::builder("Objects.Geometry.Point3")
            .extends(point())
            .field("z", FieldType::Float)
            .build()
            .unwrap();
        assert_eq!(child.speckle_type(), "Objects.Geometry.Point:Objects.Geometry.Point3");
        assert_eq!(
            child.chain().collect::<Vec<_>>(),
            vec!["Objects.Geometry.Point", "Objects.Geometry.Point3"]
        );
        assert_eq!(child.fields().len(), 3);
    }

    #[test]
    fn extending_generic_base_keeps_plain_name() {
        let schema = TypeSchema::builder("Wall")
            .extends(Arc::new(TypeSchema::base()))
            .build()
            .unwrap();
        assert_eq!(schema.speckle_type(), "Wall");
    }

    #[test]
    fn subtype_may_redeclare_inherited_field() {
        let child = TypeSchema::builder("Tagged")
            .extends(point())
            .detached("x", FieldType::Any)
            .build()
            .unwrap();
        assert_eq!(child.field("x").unwrap().role, FieldRole::Detached);
        assert_eq!(child.fields().len(), 2);
    }

    #[test]
    fn duplicate_field_rejected() {
        let err = TypeSchema::builder("T")
            .field("a", FieldType::Int)
            .field("a", FieldType::Int)
            .build()
            .unwrap_err();
        assert!(matches!(err, ModelError::DuplicateField { .. }));
    }

    #[test]
    fn reserved_and_invalid_names_rejected() {
        assert!(matches!(
            TypeSchema::builder("T").field("id", FieldType::String).build(),
            Err(ModelError::ReservedName(_))
        ));
        assert!(matches!(
            TypeSchema::builder("A:B").build(),
            Err(ModelError::InvalidTypeName(_))
        ));
        assert!(matches!(
            TypeSchema::builder("T").chunked("pts", 0).build(),
            Err(ModelError::InvalidChunkSize { .. })
        ));
    }

    #[test]
    fn field_type_acceptance() {
        assert!(FieldType::Float.accepts(&Value::Int(1)));
        assert!(!FieldType::Int.accepts(&Value::Float(1.0)));
        assert!(FieldType::String.accepts(&Value::Null));
        assert!(FieldType::Any.accepts(&Value::from("x")));
        assert!(!FieldType::Bool.accepts(&Value::from("x")));
    }

    #[test]
    fn defaults_per_type() {
        assert_eq!(FieldType::Int.default_value(), Value::Int(0));
        assert_eq!(FieldType::String.default_value(), Value::from(""));
        assert_eq!(FieldType::Object.default_value(), Value::Null);
    }

    #[test]
    fn detached_roles() {
        assert!(FieldRole::Detached.is_detached());
        assert!(FieldRole::Chunked { chunk_size: 3 }.is_detached());
        assert!(!FieldRole::Plain.is_detached());
    }
}
