use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use speckle_types::ObjectId;

use crate::error::{ModelError, ModelResult};
use crate::names;
use crate::schema::{FieldRole, TypeSchema};
use crate::value::Value;

/// A typed, dynamically extensible property bag.
///
/// Typed fields come from the object's [`TypeSchema`]; any other property is
/// dynamic and takes its serialization role from its name (see
/// [`names`](crate::names)). Properties are behind a lock so a `Base` can be
/// shared through `Arc` and still be edited, which also makes self-referencing
/// graphs expressible. The serializer rejects those.
///
/// The id is only known once the object has been serialized, and any edit
/// clears it again.
pub struct Base {
    schema: Arc<TypeSchema>,
    speckle_type: String,
    state: RwLock<BaseState>,
}

#[derive(Default)]
struct BaseState {
    id: Option<ObjectId>,
    application_id: Option<String>,
    typed: BTreeMap<String, Value>,
    dynamic: BTreeMap<String, Value>,
}

/// One property of a [`Base`] as seen by the serializer.
#[derive(Clone, Debug)]
pub struct Member {
    pub name: String,
    pub value: Value,
    pub role: FieldRole,
}

impl Base {
    /// Create an instance of `schema` with every typed field at its default.
    pub fn new(schema: Arc<TypeSchema>) -> Self {
        let speckle_type = schema.speckle_type().to_string();
        Self::with_type(schema, speckle_type)
    }

    /// Create an instance of `schema` that reports `speckle_type` as its
    /// discriminator. Used when a wire type resolves to a less derived
    /// schema, so the original discriminator survives a round trip.
    pub fn with_type(schema: Arc<TypeSchema>, speckle_type: impl Into<String>) -> Self {
        let typed = schema
            .fields()
            .iter()
            .map(|f| (f.name.clone(), f.ty.default_value()))
            .collect();
        Self {
            schema,
            speckle_type: speckle_type.into(),
            state: RwLock::new(BaseState {
                typed,
                ..Default::default()
            }),
        }
    }

    /// A generic object with no typed fields.
    pub fn dynamic() -> Self {
        Self::new(Arc::new(TypeSchema::base()))
    }

    /// Set a property and return `self`, for building objects inline.
    pub fn with(self, name: &str, value: impl Into<Value>) -> ModelResult<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    pub fn schema(&self) -> &Arc<TypeSchema> {
        &self.schema
    }

    pub fn speckle_type(&self) -> &str {
        &self.speckle_type
    }

    /// Content id from the last serialization, if any.
    pub fn id(&self) -> Option<ObjectId> {
        self.state.read().id
    }

    pub fn set_id(&self, id: ObjectId) {
        self.state.write().id = Some(id);
    }

    pub fn application_id(&self) -> Option<String> {
        self.state.read().application_id.clone()
    }

    pub fn set_application_id(&self, application_id: Option<String>) {
        self.state.write().application_id = application_id;
    }

    /// Read a typed or dynamic property.
    pub fn get(&self, name: &str) -> Option<Value> {
        let state = self.state.read();
        state
            .typed
            .get(name)
            .or_else(|| state.dynamic.get(name))
            .cloned()
    }

    /// Write a property.
    ///
    /// Typed fields are checked against their declared type; dynamic names
    /// are validated. Clears the cached id.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> ModelResult<()> {
        let value = value.into();
        if let Some(field) = self.schema.field(name) {
            if !field.ty.accepts(&value) {
                return Err(ModelError::TypeMismatch {
                    field: name.to_string(),
                    expected: field.ty.name().to_string(),
                    actual: value.kind().to_string(),
                });
            }
            let mut state = self.state.write();
            state.typed.insert(name.to_string(), value);
            state.id = None;
            return Ok(());
        }
        names::validate_dynamic_name(name)?;
        let mut state = self.state.write();
        state.dynamic.insert(name.to_string(), value);
        state.id = None;
        Ok(())
    }

    /// Write a property without type or name checks.
    ///
    /// For decoders that must keep whatever another producer wrote.
    pub fn set_unchecked(&self, name: &str, value: Value) {
        let mut state = self.state.write();
        if self.schema.field(name).is_some() {
            state.typed.insert(name.to_string(), value);
        } else {
            state.dynamic.insert(name.to_string(), value);
        }
        state.id = None;
    }

    /// Remove a dynamic property. Typed fields cannot be removed.
    pub fn remove(&self, name: &str) -> Option<Value> {
        let mut state = self.state.write();
        let removed = state.dynamic.remove(name);
        if removed.is_some() {
            state.id = None;
        }
        removed
    }

    pub fn dynamic_names(&self) -> Vec<String> {
        self.state.read().dynamic.keys().cloned().collect()
    }

    /// Every property with its serialization role: typed fields in schema
    /// order, then dynamic properties by name.
    pub fn members(&self) -> Vec<Member> {
        let state = self.state.read();
        let typed = self.schema.fields().iter().map(|field| Member {
            name: field.name.clone(),
            value: state.typed.get(&field.name).cloned().unwrap_or_default(),
            role: field.role,
        });
        let dynamic = state.dynamic.iter().map(|(name, value)| Member {
            name: name.clone(),
            value: value.clone(),
            role: names::role_of(name),
        });
        typed.chain(dynamic).collect()
    }

    /// Structural equality: discriminator, application id and every
    /// non-ignored property. Ids are not compared.
    pub fn content_eq(&self, other: &Base) -> bool {
        if self.speckle_type != other.speckle_type || self.application_id() != other.application_id() {
            return false;
        }
        let visible = |base: &Base| -> BTreeMap<String, Value> {
            base.members()
                .into_iter()
                .filter(|m| m.role != FieldRole::Ignored)
                .map(|m| (m.name, m.value))
                .collect()
        };
        visible(self) == visible(other)
    }
}

impl fmt::Debug for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Base")
            .field("speckle_type", &self.speckle_type)
            .field("id", &state.id)
            .field("typed", &state.typed.len())
            .field("dynamic", &state.dynamic.len())
            .finish()
    }
}
