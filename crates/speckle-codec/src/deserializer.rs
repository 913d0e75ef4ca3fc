use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use speckle_model::{builtins, Base, FieldDescriptor, FieldType, TypeRegistry, Value};
use speckle_types::{wire, Closure, ObjectId, ObjectReference};
use tracing::warn;

use crate::error::{DeserializeError, DeserializeResult};

/// What to do with a reference whose target cannot be found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingReferencePolicy {
    /// Fail with [`DeserializeError::MissingReference`].
    #[default]
    Strict,
    /// Put `null` in place of the missing object.
    Tolerant,
}

/// Deserializer settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeserializerOptions {
    pub missing_references: MissingReferencePolicy,
}

/// State of a referenced fragment as seen by a decoder.
#[derive(Clone, Debug)]
pub enum RefState {
    /// Decoded and ready to be linked.
    Resolved(Arc<Base>),
    /// Known not to exist anywhere.
    Absent,
    /// Not decoded yet.
    Pending,
}

/// Source of already-decoded objects consulted while decoding a fragment.
pub trait DecodeLookup {
    fn lookup(&self, id: &ObjectId) -> RefState;
}

/// A lookup that knows nothing; every reference is absent.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoReferences;

impl DecodeLookup for NoReferences {
    fn lookup(&self, _id: &ObjectId) -> RefState {
        RefState::Absent
    }
}

/// Outcome of one decode attempt.
#[derive(Debug)]
pub enum DecodeStep {
    Ready(Arc<Base>),
    /// These referenced ids are not decoded yet. Retry later.
    Blocked(Vec<ObjectId>),
}

/// Rebuilds [`Base`] objects from fragment JSON.
///
/// Decoding a fragment requires every fragment it references to be decoded
/// first; [`decode_step`](Self::decode_step) reports which ones are still
/// pending instead of waiting for them, so callers can requeue the work.
/// Discriminators are resolved through the [`TypeRegistry`]; JSON members
/// without a schema field are kept as dynamic properties, and schema fields
/// absent from the JSON keep their defaults.
#[derive(Debug, Clone)]
pub struct BaseDeserializer {
    registry: Arc<TypeRegistry>,
    options: DeserializerOptions,
}

impl BaseDeserializer {
    pub fn new(registry: Arc<TypeRegistry>, options: DeserializerOptions) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &DeserializerOptions {
        &self.options
    }

    /// Parse fragment JSON into an object map.
    pub fn parse(id: Option<ObjectId>, json: &str) -> DeserializeResult<Map<String, Json>> {
        match serde_json::from_str::<Json>(json) {
            Ok(Json::Object(map)) => Ok(map),
            Ok(_) => Err(DeserializeError::NotAnObject { id }),
            Err(e) => Err(DeserializeError::MalformedJson {
                id,
                reason: e.to_string(),
            }),
        }
    }

    /// The closure recorded in a fragment, empty if it has none.
    pub fn closure_of(id: Option<ObjectId>, map: &Map<String, Json>) -> DeserializeResult<Closure> {
        match map.get(wire::CLOSURE) {
            None | Some(Json::Null) => Ok(Closure::new()),
            Some(value) => Closure::from_json(value).map_err(|e| DeserializeError::MalformedJson {
                id,
                reason: e.to_string(),
            }),
        }
    }

    /// Every id referenced by a placeholder anywhere in the fragment, sorted
    /// and without duplicates. The `__closure` member is not scanned.
    pub fn references(id: Option<ObjectId>, map: &Map<String, Json>) -> DeserializeResult<Vec<ObjectId>> {
        let mut found = Vec::new();
        for (key, value) in map {
            if key != wire::CLOSURE {
                collect_references(id, value, &mut found)?;
            }
        }
        found.sort();
        found.dedup();
        Ok(found)
    }

    /// Decode a fragment if every object it references is available.
    pub fn decode_step(
        &self,
        id: ObjectId,
        map: &Map<String, Json>,
        lookup: &dyn DecodeLookup,
    ) -> DeserializeResult<DecodeStep> {
        let pending: Vec<ObjectId> = Self::references(Some(id), map)?
            .into_iter()
            .filter(|r| matches!(lookup.lookup(r), RefState::Pending))
            .collect();
        if !pending.is_empty() {
            return Ok(DecodeStep::Blocked(pending));
        }
        let ctx = Ctx { fragment: Some(id) };
        let base = self.materialize(&ctx, map, lookup)?;
        base.set_id(id);
        Ok(DecodeStep::Ready(base))
    }

    /// Decode a standalone JSON document that has no references to resolve.
    ///
    /// Objects are recognized by their `speckle_type`; anything else becomes
    /// a map. A document that does contain references follows the missing
    /// reference policy.
    pub fn decode_document(&self, json: &str) -> DeserializeResult<Arc<Base>> {
        let map = Self::parse(None, json)?;
        let ctx = Ctx { fragment: None };
        if map.contains_key(wire::SPECKLE_TYPE) {
            return self.materialize(&ctx, &map, &NoReferences);
        }
        let root = self.registry.create(wire::BASE_TYPE);
        for (key, value) in &map {
            let decoded = self.decode_any(&ctx, value, &NoReferences)?;
            root.set_unchecked(key, decoded);
        }
        Ok(Arc::new(root))
    }

    fn materialize(&self, ctx: &Ctx, map: &Map<String, Json>, lookup: &dyn DecodeLookup) -> DeserializeResult<Arc<Base>> {
        let speckle_type = map
            .get(wire::SPECKLE_TYPE)
            .and_then(Json::as_str)
            .unwrap_or(wire::BASE_TYPE);
        let base = self.registry.create(speckle_type);

        for (key, value) in map {
            if wire::is_reserved(key) {
                continue;
            }
            let decoded = match base.schema().field(key) {
                Some(field) => self.decode_typed(ctx, field, value, lookup)?,
                None => self.decode_any(ctx, value, lookup)?,
            };
            base.set_unchecked(key, decoded);
        }

        if let Some(application_id) = map.get(wire::APPLICATION_ID).and_then(Json::as_str) {
            base.set_application_id(Some(application_id.to_string()));
        }
        if let Some(raw) = map.get(wire::ID).and_then(Json::as_str) {
            let id = ObjectId::from_hex(raw).map_err(|_| DeserializeError::InvalidId(raw.to_string()))?;
            base.set_id(id);
        }
        Ok(Arc::new(base))
    }

    fn decode_any(&self, ctx: &Ctx, value: &Json, lookup: &dyn DecodeLookup) -> DeserializeResult<Value> {
        Ok(match value {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::List(self.decode_list(ctx, items, lookup)?),
            Json::Object(map) => self.decode_object(ctx, map, lookup)?,
        })
    }

    fn decode_object(&self, ctx: &Ctx, map: &Map<String, Json>, lookup: &dyn DecodeLookup) -> DeserializeResult<Value> {
        let target = ObjectReference::target_of(map).map_err(|e| DeserializeError::MalformedJson {
            id: ctx.fragment,
            reason: e.to_string(),
        })?;
        if let Some(target) = target {
            return match lookup.lookup(&target) {
                RefState::Resolved(base) => Ok(Value::Object(base)),
                RefState::Absent | RefState::Pending => self.missing(ctx, target),
            };
        }
        if map.contains_key(wire::SPECKLE_TYPE) {
            return Ok(Value::Object(self.materialize(ctx, map, lookup)?));
        }
        let mut out = BTreeMap::new();
        for (key, item) in map {
            out.insert(key.clone(), self.decode_any(ctx, item, lookup)?);
        }
        Ok(Value::Map(out))
    }

    /// Decode a JSON array, splicing the contents of chunk objects back into
    /// the list in order.
    fn decode_list(&self, ctx: &Ctx, items: &[Json], lookup: &dyn DecodeLookup) -> DeserializeResult<Vec<Value>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match self.decode_any(ctx, item, lookup)? {
                Value::Object(base) if builtins::is_data_chunk(&base) => match base.get(wire::CHUNK_DATA) {
                    Some(Value::List(data)) => out.extend(data),
                    other => {
                        return Err(DeserializeError::TypeMismatch {
                            id: base.id().or(ctx.fragment),
                            field: wire::CHUNK_DATA.to_string(),
                            expected: "list".to_string(),
                            actual: other.map_or("missing", |v| v.kind()).to_string(),
                        })
                    }
                },
                other => out.push(other),
            }
        }
        Ok(out)
    }

    fn decode_typed(
        &self,
        ctx: &Ctx,
        field: &FieldDescriptor,
        value: &Json,
        lookup: &dyn DecodeLookup,
    ) -> DeserializeResult<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = || DeserializeError::TypeMismatch {
            id: ctx.fragment,
            field: field.name.clone(),
            expected: field.ty.name().to_string(),
            actual: json_kind(value).to_string(),
        };
        Ok(match field.ty {
            FieldType::Any => self.decode_any(ctx, value, lookup)?,
            FieldType::Bool => Value::Bool(value.as_bool().ok_or_else(mismatch)?),
            FieldType::Int => Value::Int(as_integer(value).ok_or_else(mismatch)?),
            FieldType::Enum => Value::Enum(as_integer(value).ok_or_else(mismatch)?),
            FieldType::Float => Value::Float(value.as_f64().ok_or_else(mismatch)?),
            FieldType::String => Value::String(value.as_str().ok_or_else(mismatch)?.to_string()),
            FieldType::Timestamp => {
                let raw = value.as_str().ok_or_else(mismatch)?;
                let parsed = DateTime::parse_from_rfc3339(raw).map_err(|_| mismatch())?;
                Value::Timestamp(parsed.with_timezone(&Utc))
            }
            FieldType::Matrix => {
                let cells = value.as_array().filter(|a| a.len() == 16).ok_or_else(mismatch)?;
                let mut matrix = [0.0; 16];
                for (slot, cell) in matrix.iter_mut().zip(cells) {
                    *slot = cell.as_f64().ok_or_else(mismatch)?;
                }
                Value::Matrix(Box::new(matrix))
            }
            FieldType::List => {
                let items = value.as_array().ok_or_else(mismatch)?;
                Value::List(self.decode_list(ctx, items, lookup)?)
            }
            FieldType::Map => {
                let map = value
                    .as_object()
                    .filter(|m| !m.contains_key(wire::SPECKLE_TYPE))
                    .ok_or_else(mismatch)?;
                let mut out = BTreeMap::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.decode_any(ctx, item, lookup)?);
                }
                Value::Map(out)
            }
            FieldType::Object => {
                let map = value
                    .as_object()
                    .filter(|m| m.contains_key(wire::SPECKLE_TYPE))
                    .ok_or_else(mismatch)?;
                self.decode_object(ctx, map, lookup)?
            }
        })
    }

    fn missing(&self, ctx: &Ctx, target: ObjectId) -> DeserializeResult<Value> {
        match self.options.missing_references {
            MissingReferencePolicy::Strict => Err(DeserializeError::MissingReference {
                id: target,
                referenced_by: ctx.fragment,
            }),
            MissingReferencePolicy::Tolerant => {
                warn!(
                    missing = %target.short_hex(),
                    referenced_by = ?ctx.fragment.map(|id| id.short_hex()),
                    "substituting null for missing reference"
                );
                Ok(Value::Null)
            }
        }
    }
}

struct Ctx {
    fragment: Option<ObjectId>,
}

fn collect_references(id: Option<ObjectId>, value: &Json, found: &mut Vec<ObjectId>) -> DeserializeResult<()> {
    match value {
        Json::Array(items) => {
            for item in items {
                collect_references(id, item, found)?;
            }
        }
        Json::Object(map) => {
            let target = ObjectReference::target_of(map).map_err(|e| DeserializeError::MalformedJson {
                id,
                reason: e.to_string(),
            })?;
            match target {
                Some(target) => found.push(target),
                None => {
                    for (key, item) in map {
                        if key != wire::CLOSURE {
                            collect_references(id, item, found)?;
                        }
                    }
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn as_integer(value: &Json) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
}

fn json_kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}
