use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value as Json};
use speckle_hash::{write_canonical_object, ContentHasher};
use speckle_model::{builtins, Base, FieldRole, TypeRegistry, TypeSchema, Value};
use speckle_types::{reference, wire, Closure, Fragment, ObjectId, ObjectReference};
use tracing::debug;

use crate::error::{SerializeError, SerializeResult};
use crate::sink::FragmentSink;

/// Serializer settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializerOptions {
    /// Record `applicationId -> reference` for every detached object that has
    /// an application id.
    pub track_detached_children: bool,
}

/// A file that must be uploaded next to the fragments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobRef {
    pub id: ObjectId,
    pub path: PathBuf,
}

/// What a serialization produced besides the fragments themselves.
#[derive(Clone, Debug)]
pub struct SerializeSummary {
    pub root_id: ObjectId,
    pub closure: Closure,
    pub tracked: BTreeMap<String, ObjectReference>,
    pub blobs: Vec<BlobRef>,
    /// Fragments emitted, root included.
    pub fragment_count: usize,
    pub total_bytes: usize,
}

/// A fully serialized graph held in memory.
#[derive(Clone, Debug)]
pub struct SerializedGraph {
    pub root: Fragment,
    /// Detached fragments in emission order (children before parents).
    pub detached: Vec<Fragment>,
    pub summary: SerializeSummary,
}

impl SerializedGraph {
    pub fn root_id(&self) -> ObjectId {
        self.root.id
    }

    pub fn closure(&self) -> &Closure {
        &self.summary.closure
    }

    /// Every fragment, root last.
    pub fn fragments(&self) -> impl Iterator<Item = &Fragment> {
        self.detached.iter().chain(std::iter::once(&self.root))
    }

    pub fn len(&self) -> usize {
        self.detached.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Fragments keyed by id, for feeding a deserializer.
    pub fn to_map(&self) -> HashMap<ObjectId, String> {
        self.fragments().map(|f| (f.id, f.json.clone())).collect()
    }
}

/// Decomposes a [`Base`] graph into content-addressed fragments.
///
/// The walk is depth-first with children finished before their parent. Each
/// object's fields are encoded, its closure assembled from what its children
/// return, and its id computed over the canonical body. Detached children
/// become their own fragments behind reference placeholders; inlined
/// children are embedded with their id and contribute their closure entries
/// unchanged.
///
/// Self-referencing graphs are rejected with [`SerializeError::Cycle`].
#[derive(Debug)]
pub struct BaseSerializer {
    options: SerializerOptions,
    chunk_schema: Arc<TypeSchema>,
}

impl BaseSerializer {
    pub fn new(options: SerializerOptions) -> Self {
        Self {
            options,
            chunk_schema: Arc::new(builtins::data_chunk_schema()),
        }
    }

    /// A serializer whose chunks use the registry's chunk schema.
    pub fn with_registry(registry: &TypeRegistry, options: SerializerOptions) -> Self {
        Self {
            options,
            chunk_schema: registry.data_chunk(),
        }
    }

    pub fn options(&self) -> &SerializerOptions {
        &self.options
    }

    /// Serialize into memory.
    pub fn serialize(&self, root: &Base) -> SerializeResult<SerializedGraph> {
        let mut fragments: Vec<Fragment> = Vec::new();
        let summary = self.serialize_into(root, &mut fragments)?;
        let root = fragments
            .pop()
            .ok_or_else(|| SerializeError::Sink("root fragment was not emitted".into()))?;
        Ok(SerializedGraph {
            root,
            detached: fragments,
            summary,
        })
    }

    /// Serialize, handing each fragment to `sink` as soon as it is complete.
    /// The root fragment is delivered last.
    pub fn serialize_into<S: FragmentSink + ?Sized>(
        &self,
        root: &Base,
        sink: &mut S,
    ) -> SerializeResult<SerializeSummary> {
        let mut walk = Walk {
            sink,
            options: &self.options,
            chunk_schema: &self.chunk_schema,
            stack: Vec::new(),
            path: Vec::new(),
            memo: HashMap::new(),
            emitted: HashSet::new(),
            tracked: BTreeMap::new(),
            blobs: BTreeMap::new(),
            fragment_count: 0,
            total_bytes: 0,
        };
        let encoded = walk.encode_base(root, true)?;
        walk.emit(&encoded)?;

        debug!(
            root = %encoded.id.short_hex(),
            fragments = walk.fragment_count,
            bytes = walk.total_bytes,
            closure = encoded.closure.len(),
            "serialized graph"
        );

        Ok(SerializeSummary {
            root_id: encoded.id,
            closure: encoded.closure,
            tracked: walk.tracked,
            blobs: walk
                .blobs
                .into_iter()
                .map(|(id, path)| BlobRef { id, path })
                .collect(),
            fragment_count: walk.fragment_count,
            total_bytes: walk.total_bytes,
        })
    }
}

impl Default for BaseSerializer {
    fn default() -> Self {
        Self::new(SerializerOptions::default())
    }
}

/// One encoded object: its id, body (without `id`) and closure.
struct Encoded {
    id: ObjectId,
    speckle_type: String,
    body: Map<String, Json>,
    closure: Closure,
}

struct Walk<'a, S: ?Sized> {
    sink: &'a mut S,
    options: &'a SerializerOptions,
    chunk_schema: &'a Arc<TypeSchema>,
    /// Addresses of the objects currently being encoded.
    stack: Vec<usize>,
    path: Vec<String>,
    /// Detached objects already encoded in this run. The `Arc` keeps the
    /// address from being reused while the walk lasts.
    memo: HashMap<usize, (Arc<Base>, ObjectId, Closure)>,
    emitted: HashSet<ObjectId>,
    tracked: BTreeMap<String, ObjectReference>,
    blobs: BTreeMap<ObjectId, PathBuf>,
    fragment_count: usize,
    total_bytes: usize,
}

impl<S: FragmentSink + ?Sized> Walk<'_, S> {
    fn path_string(&self) -> String {
        if self.path.is_empty() {
            "<root>".to_string()
        } else {
            self.path.join(".")
        }
    }

    fn encode_base(&mut self, base: &Base, detached: bool) -> SerializeResult<Encoded> {
        let addr = base as *const Base as usize;
        if self.stack.contains(&addr) {
            return Err(SerializeError::Cycle {
                speckle_type: base.speckle_type().to_string(),
                path: self.path_string(),
            });
        }
        self.stack.push(addr);
        let result = self.encode_members(base, detached);
        self.stack.pop();
        result
    }

    fn encode_members(&mut self, base: &Base, detached: bool) -> SerializeResult<Encoded> {
        let mut body = Map::new();
        let mut closure = Closure::new();
        body.insert(wire::SPECKLE_TYPE.into(), Json::from(base.speckle_type()));

        for member in base.members() {
            if member.role == FieldRole::Ignored || wire::is_reserved(&member.name) {
                continue;
            }
            self.path.push(member.name.clone());
            let encoded = match (member.role, &member.value) {
                (FieldRole::Chunked { chunk_size }, Value::List(items)) => {
                    self.encode_chunks(items, chunk_size, &mut closure)
                }
                (role, value) => self.encode_value(value, &mut closure, role.is_detached()),
            };
            self.path.pop();
            body.insert(member.name, encoded?);
        }

        if !closure.is_empty() {
            body.insert(wire::CLOSURE.into(), closure.to_json());
        }
        if detached {
            body.insert(wire::TOTAL_CHILDREN_COUNT.into(), Json::from(closure.len()));
        }
        if let Some(application_id) = base.application_id() {
            body.insert(wire::APPLICATION_ID.into(), Json::from(application_id));
        }

        let id = if builtins::is_blob(base) {
            self.blob_id(base)?
        } else {
            ContentHasher::hash_object(&body)
        };
        base.set_id(id);

        Ok(Encoded {
            id,
            speckle_type: base.speckle_type().to_string(),
            body,
            closure,
        })
    }

    fn blob_id(&mut self, base: &Base) -> SerializeResult<ObjectId> {
        let path = builtins::blob_path(base).ok_or_else(|| SerializeError::Blob {
            path: self.path_string(),
            reason: "blob has no file path".into(),
        })?;
        let id = ContentHasher::hash_file(&path)?;
        self.blobs.insert(id, path);
        Ok(id)
    }

    fn encode_value(&mut self, value: &Value, closure: &mut Closure, detach: bool) -> SerializeResult<Json> {
        Ok(match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) | Value::Enum(i) => Json::from(*i),
            Value::Float(f) => self.number(*f, "float")?,
            Value::String(s) => Json::String(s.clone()),
            Value::Timestamp(t) => Json::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Value::Matrix(m) => {
                let mut cells = Vec::with_capacity(16);
                for cell in m.iter() {
                    cells.push(self.number(*cell, "matrix")?);
                }
                Json::Array(cells)
            }
            Value::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.encode_value(item, closure, detach)?);
                }
                Json::Array(out)
            }
            Value::Map(map) => {
                // A map carrying a discriminator would read back as an object.
                if map.contains_key(wire::SPECKLE_TYPE) {
                    return Err(SerializeError::UnsupportedValue {
                        path: self.path_string(),
                        kind: "map".to_string(),
                        reason: format!("map key {:?} is reserved for objects", wire::SPECKLE_TYPE),
                    });
                }
                let mut out = Map::new();
                for (key, item) in map {
                    self.path.push(key.clone());
                    let encoded = self.encode_value(item, closure, detach);
                    self.path.pop();
                    out.insert(key.clone(), encoded?);
                }
                Json::Object(out)
            }
            Value::Object(child) if detach => self.detach(child, closure)?,
            Value::Object(child) => {
                let mut encoded = self.encode_base(child, false)?;
                closure.absorb(&encoded.closure);
                encoded.body.insert(wire::ID.into(), Json::from(encoded.id.to_hex()));
                Json::Object(encoded.body)
            }
            Value::Reference(r) => {
                match &r.closure {
                    Some(known) => closure.record_child(r.referenced_id, known),
                    None => closure.record_child(r.referenced_id, &Closure::new()),
                }
                r.to_placeholder()
            }
        })
    }

    fn number(&self, f: f64, kind: &str) -> SerializeResult<Json> {
        Number::from_f64(f)
            .map(Json::Number)
            .ok_or_else(|| SerializeError::UnsupportedValue {
                path: self.path_string(),
                kind: kind.to_string(),
                reason: format!("non-finite number {f}"),
            })
    }

    fn encode_chunks(&mut self, items: &[Value], chunk_size: usize, closure: &mut Closure) -> SerializeResult<Json> {
        if chunk_size == 0 {
            return Err(SerializeError::InvalidChunkSize {
                field: self.path_string(),
            });
        }
        let mut references = Vec::with_capacity(items.len().div_ceil(chunk_size));
        for slice in items.chunks(chunk_size) {
            let chunk = Arc::new(builtins::data_chunk(self.chunk_schema, slice.to_vec()));
            references.push(self.detach(&chunk, closure)?);
        }
        Ok(Json::Array(references))
    }

    fn detach(&mut self, child: &Arc<Base>, closure: &mut Closure) -> SerializeResult<Json> {
        let addr = Arc::as_ptr(child) as usize;
        if let Some((_, id, child_closure)) = self.memo.get(&addr) {
            closure.record_child(*id, child_closure);
            return Ok(reference::placeholder(*id));
        }

        let encoded = self.encode_base(child, true)?;
        self.emit(&encoded)?;
        closure.record_child(encoded.id, &encoded.closure);

        if self.options.track_detached_children {
            if let Some(application_id) = child.application_id() {
                self.tracked.insert(
                    application_id,
                    ObjectReference::with_closure(encoded.id, encoded.closure.clone()),
                );
            }
        }

        self.memo
            .insert(addr, (child.clone(), encoded.id, encoded.closure));
        Ok(reference::placeholder(encoded.id))
    }

    fn emit(&mut self, encoded: &Encoded) -> SerializeResult<()> {
        if !self.emitted.insert(encoded.id) {
            return Ok(());
        }
        let json = fragment_json(&encoded.body, encoded.id);
        self.fragment_count += 1;
        self.total_bytes += json.len();
        self.sink
            .accept(Fragment::new(encoded.id, json, encoded.speckle_type.clone()))
    }
}

/// Render a body canonically with `"id"` appended as the last field.
fn fragment_json(body: &Map<String, Json>, id: ObjectId) -> String {
    let mut out = String::with_capacity(256);
    write_canonical_object(body, &mut out);
    out.pop();
    if !body.is_empty() {
        out.push(',');
    }
    out.push_str("\"id\":\"");
    out.push_str(&id.to_hex());
    out.push_str("\"}");
    out
}
