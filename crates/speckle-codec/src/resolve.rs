use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use speckle_model::Base;
use speckle_types::ObjectId;
use tracing::debug;

use crate::deserializer::{BaseDeserializer, DecodeLookup, DecodeStep, RefState};
use crate::error::{DeserializeError, DeserializeResult};
use crate::plan::FragmentSet;

/// Synchronous access to fragment JSON by id.
pub trait FragmentSource {
    /// `Ok(None)` means the fragment does not exist in this source.
    fn fetch(&self, id: &ObjectId) -> DeserializeResult<Option<String>>;
}

impl FragmentSource for HashMap<ObjectId, String> {
    fn fetch(&self, id: &ObjectId) -> DeserializeResult<Option<String>> {
        Ok(self.get(id).cloned())
    }
}

impl FragmentSource for BTreeMap<ObjectId, String> {
    fn fetch(&self, id: &ObjectId) -> DeserializeResult<Option<String>> {
        Ok(self.get(id).cloned())
    }
}

/// Adapter turning a closure into a [`FragmentSource`].
pub struct FnSource<F>(pub F);

impl<F> FragmentSource for FnSource<F>
where
    F: Fn(&ObjectId) -> DeserializeResult<Option<String>>,
{
    fn fetch(&self, id: &ObjectId) -> DeserializeResult<Option<String>> {
        (self.0)(id)
    }
}

struct Resolved<'a> {
    objects: &'a HashMap<ObjectId, Arc<Base>>,
    absent: &'a HashSet<ObjectId>,
}

impl DecodeLookup for Resolved<'_> {
    fn lookup(&self, id: &ObjectId) -> RefState {
        if let Some(base) = self.objects.get(id) {
            RefState::Resolved(base.clone())
        } else if self.absent.contains(id) {
            RefState::Absent
        } else {
            RefState::Pending
        }
    }
}

impl BaseDeserializer {
    /// Load the root fragment, everything in its closure, and any reference
    /// the closure failed to mention.
    pub fn gather<S: FragmentSource + ?Sized>(&self, root_id: ObjectId, source: &S) -> DeserializeResult<FragmentSet> {
        let mut set = FragmentSet::new();
        let root_json = source
            .fetch(&root_id)?
            .ok_or(DeserializeError::MissingReference {
                id: root_id,
                referenced_by: None,
            })?;
        set.insert_json(root_id, &root_json)?;

        let closure = match set.get(&root_id) {
            Some(map) => Self::closure_of(Some(root_id), map)?,
            None => Default::default(),
        };
        for id in closure.depth_order() {
            match source.fetch(&id)? {
                Some(json) => set.insert_json(id, &json)?,
                None => set.mark_absent(id),
            }
        }

        loop {
            let unknown = set.unknown_references()?;
            if unknown.is_empty() {
                break;
            }
            debug!(count = unknown.len(), "fetching references missing from closure");
            for id in unknown {
                match source.fetch(&id)? {
                    Some(json) => set.insert_json(id, &json)?,
                    None => set.mark_absent(id),
                }
            }
        }
        Ok(set)
    }

    /// Rebuild the graph rooted at `root_id` from `source`.
    ///
    /// Fragments are decoded through a work queue in dependency order; a
    /// fragment whose references are not decoded yet goes to the back of the
    /// queue. Each id is decoded once and shared by every parent that
    /// references it.
    pub fn deserialize<S: FragmentSource + ?Sized>(&self, root_id: ObjectId, source: &S) -> DeserializeResult<Arc<Base>> {
        let set = self.gather(root_id, source)?;
        let order = set.dependency_order()?;

        let mut objects: HashMap<ObjectId, Arc<Base>> = HashMap::with_capacity(order.len());
        let mut queue: VecDeque<ObjectId> = order.into();
        let mut stalled = 0usize;

        while let Some(id) = queue.pop_front() {
            let map = set.get(&id).ok_or(DeserializeError::MissingReference {
                id,
                referenced_by: None,
            })?;
            let lookup = Resolved {
                objects: &objects,
                absent: set.absent(),
            };
            match self.decode_step(id, map, &lookup)? {
                DecodeStep::Ready(base) => {
                    objects.insert(id, base);
                    stalled = 0;
                }
                DecodeStep::Blocked(_) => {
                    stalled += 1;
                    if stalled > queue.len() {
                        let mut ids: Vec<ObjectId> = queue.iter().copied().collect();
                        ids.push(id);
                        ids.sort();
                        return Err(DeserializeError::UnresolvableDependencies { ids });
                    }
                    queue.push_back(id);
                }
            }
        }

        debug!(root = %root_id.short_hex(), objects = objects.len(), "deserialized graph");
        objects.remove(&root_id).ok_or(DeserializeError::MissingReference {
            id: root_id,
            referenced_by: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deserializer::{DeserializerOptions, MissingReferencePolicy};
    use crate::serializer::BaseSerializer;
    use proptest::prelude::*;
    use speckle_model::{FieldType, TypeRegistry, TypeSchema, Value};
    use speckle_types::Closure;
    use std::cell::RefCell;

    fn deserializer(policy: MissingReferencePolicy) -> BaseDeserializer {
        BaseDeserializer::new(
            Arc::new(TypeRegistry::with_builtins()),
            DeserializerOptions {
                missing_references: policy,
            },
        )
    }

    fn sample_graph() -> Base {
        let leaf = Base::dynamic().with("v", 3).unwrap();
        let shared = Arc::new(Base::dynamic().with("shared", true).unwrap());
        let mid = Base::dynamic()
            .with("@leaf", leaf)
            .unwrap()
            .with("@shared", shared.clone())
            .unwrap();
        Base::dynamic()
            .with("name", "level 1")
            .unwrap()
            .with("@mid", mid)
            .unwrap()
            .with("@also", shared)
            .unwrap()
            .with("inline", Base::dynamic().with("z", 2.5).unwrap())
            .unwrap()
            .with("@(3)values", Value::list(0..8))
            .unwrap()
            .with("tags", Value::list(["a", "b"]))
            .unwrap()
    }

    #[test]
    fn round_trip_preserves_structure_and_id() {
        let root = sample_graph();
        let graph = BaseSerializer::default().serialize(&root).unwrap();
        let decoded = deserializer(MissingReferencePolicy::Strict)
            .deserialize(graph.root_id(), &graph.to_map())
            .unwrap();

        assert!(decoded.content_eq(&root));
        assert_eq!(decoded.id(), Some(graph.root_id()));
        assert_eq!(decoded.get("@(3)values"), Some(Value::list(0..8i64)));

        let again = BaseSerializer::default().serialize(&decoded).unwrap();
        assert_eq!(again.root_id(), graph.root_id());
    }

    #[test]
    fn shared_children_decode_once() {
        let root = sample_graph();
        let graph = BaseSerializer::default().serialize(&root).unwrap();
        let decoded = deserializer(MissingReferencePolicy::Strict)
            .deserialize(graph.root_id(), &graph.to_map())
            .unwrap();
        let direct = decoded.get("@also").unwrap();
        let via_mid = decoded
            .get("@mid")
            .unwrap()
            .as_object()
            .unwrap()
            .get("@shared")
            .unwrap();
        assert!(Arc::ptr_eq(direct.as_object().unwrap(), via_mid.as_object().unwrap()));
    }

    #[test]
    fn each_fragment_fetched_once() {
        let root = sample_graph();
        let graph = BaseSerializer::default().serialize(&root).unwrap();
        let map = graph.to_map();
        let fetched = RefCell::new(Vec::new());
        {
            let source = FnSource(|id: &ObjectId| -> DeserializeResult<Option<String>> {
                fetched.borrow_mut().push(*id);
                Ok(map.get(id).cloned())
            });
            deserializer(MissingReferencePolicy::Strict)
                .deserialize(graph.root_id(), &source)
                .unwrap();
        }
        let fetched = fetched.into_inner();
        let unique: HashSet<_> = fetched.iter().collect();
        assert_eq!(fetched.len(), unique.len());
        assert_eq!(fetched.len(), graph.len());
    }

    #[test]
    fn missing_reference_strict_fails() {
        let root = Base::dynamic().with("@b", Base::dynamic().with("y", 2).unwrap()).unwrap();
        let graph = BaseSerializer::default().serialize(&root).unwrap();
        let mut map = graph.to_map();
        map.remove(&graph.detached[0].id);
        let err = deserializer(MissingReferencePolicy::Strict)
            .deserialize(graph.root_id(), &map)
            .unwrap_err();
        match err {
            DeserializeError::MissingReference { id, referenced_by } => {
                assert_eq!(id, graph.detached[0].id);
                assert_eq!(referenced_by, Some(graph.root_id()));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_reference_tolerant_yields_null() {
        let root = Base::dynamic()
            .with("@b", Base::dynamic().with("y", 2).unwrap())
            .unwrap()
            .with("keep", 1)
            .unwrap();
        let graph = BaseSerializer::default().serialize(&root).unwrap();
        let mut map = graph.to_map();
        map.remove(&graph.detached[0].id);
        let decoded = deserializer(MissingReferencePolicy::Tolerant)
            .deserialize(graph.root_id(), &map)
            .unwrap();
        assert_eq!(decoded.get("@b"), Some(Value::Null));
        assert_eq!(decoded.get("keep"), Some(Value::Int(1)));
    }

    #[test]
    fn missing_root_is_missing_reference() {
        let err = deserializer(MissingReferencePolicy::Tolerant)
            .deserialize(ObjectId::from_bytes([4; 16]), &HashMap::new())
            .unwrap_err();
        assert!(err.is_missing_reference());
    }

    #[test]
    fn references_outside_closure_are_fetched() {
        let child_json = r#"{"speckle_type":"Base","v":1,"totalChildrenCount":0}"#;
        let child_id = ObjectId::from_bytes([1; 16]);
        let root_json = format!(
            r#"{{"speckle_type":"Base","@c":{{"speckle_type":"reference","referencedId":"{child_id}"}}}}"#
        );
        let root_id = ObjectId::from_bytes([2; 16]);
        let source: HashMap<ObjectId, String> =
            HashMap::from([(child_id, child_json.to_string()), (root_id, root_json)]);
        let decoded = deserializer(MissingReferencePolicy::Strict)
            .deserialize(root_id, &source)
            .unwrap();
        let child = decoded.get("@c").unwrap();
        assert_eq!(child.as_object().unwrap().get("v"), Some(Value::Int(1)));
    }

    #[test]
    fn typed_schemas_round_trip() {
        let registry = Arc::new(TypeRegistry::with_builtins());
        let point = registry.register(
            TypeSchema::builder("Objects.Geometry.Point")
                .field("x", FieldType::Float)
                .field("y", FieldType::Float)
                .field("units", FieldType::String)
                .build()
                .unwrap(),
        );
        let line = registry.register(
            TypeSchema::builder("Objects.Geometry.Line")
                .detached("start", FieldType::Object)
                .detached("end", FieldType::Object)
                .field("kind", FieldType::Enum)
                .field("transform", FieldType::Matrix)
                .build()
                .unwrap(),
        );
        let p = |x: f64| {
            let b = Base::new(point.clone());
            b.set("x", x).unwrap();
            b.set("units", "m").unwrap();
            b
        };
        let l = Base::new(line);
        l.set("start", p(0.0)).unwrap();
        l.set("end", p(4.0)).unwrap();
        l.set("kind", Value::Enum(2)).unwrap();
        let mut m = [0.0; 16];
        m[5] = 1.0;
        l.set("transform", m).unwrap();

        let graph = BaseSerializer::default().serialize(&l).unwrap();
        let de = BaseDeserializer::new(registry, DeserializerOptions::default());
        let decoded = de.deserialize(graph.root_id(), &graph.to_map()).unwrap();
        assert!(decoded.content_eq(&l));
        assert_eq!(decoded.speckle_type(), "Objects.Geometry.Line");
    }

    // ----- Generated graphs -----

    #[derive(Debug, Clone)]
    enum Node {
        Leaf(i64),
        Text(String),
        Inline(Vec<Node>),
        Detached(Vec<Node>),
    }

    fn node() -> impl Strategy<Value = Node> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Node::Leaf),
            "[a-z]{0,6}".prop_map(Node::Text),
        ];
        leaf.prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Node::Inline),
                proptest::collection::vec(inner, 0..4).prop_map(Node::Detached),
            ]
        })
    }

    fn build(node: &Node) -> Value {
        match node {
            Node::Leaf(i) => Value::Int(*i),
            Node::Text(s) => Value::from(s.as_str()),
            Node::Inline(children) | Node::Detached(children) => {
                let base = Base::dynamic();
                for (i, child) in children.iter().enumerate() {
                    let name = if matches!(node, Node::Detached(_)) {
                        format!("@c{i}")
                    } else {
                        format!("c{i}")
                    };
                    base.set(&name, build(child)).unwrap();
                }
                Value::from(base)
            }
        }
    }

    /// Expected closure, computed independently of the serializer from the
    /// ids it assigned.
    fn expected_closure(base: &Base) -> Closure {
        let mut closure = Closure::new();
        for member in base.members() {
            if let Value::Object(child) = &member.value {
                let child_closure = expected_closure(child);
                if member.role.is_detached() {
                    closure.record_child(child.id().unwrap(), &child_closure);
                } else {
                    closure.absorb(&child_closure);
                }
            }
        }
        closure
    }

    proptest! {
        #[test]
        fn generated_graphs_round_trip(children in proptest::collection::vec(node(), 0..5)) {
            let root = match build(&Node::Inline(children)) {
                Value::Object(base) => base,
                _ => unreachable!(),
            };
            let graph = BaseSerializer::default().serialize(&root).unwrap();
            let again = BaseSerializer::default().serialize(&root).unwrap();
            prop_assert_eq!(graph.root_id(), again.root_id());

            prop_assert_eq!(graph.closure(), &expected_closure(&root));

            let decoded = deserializer(MissingReferencePolicy::Strict)
                .deserialize(graph.root_id(), &graph.to_map())
                .unwrap();
            prop_assert!(decoded.content_eq(&root));
        }

        #[test]
        fn chunking_is_transparent(n in 0usize..60, k in 1usize..9) {
            let values: Vec<Value> = (0..n as i64).map(Value::Int).collect();
            let root = Base::dynamic();
            root.set(&format!("@({k})values"), Value::List(values.clone())).unwrap();
            let graph = BaseSerializer::default().serialize(&root).unwrap();
            prop_assert_eq!(graph.detached.len(), n.div_ceil(k));
            let chunk_refs = serde_json::from_str::<serde_json::Value>(&graph.root.json).unwrap()
                [format!("@({k})values")].as_array().unwrap().len();
            prop_assert_eq!(chunk_refs, n.div_ceil(k));

            let decoded = deserializer(MissingReferencePolicy::Strict)
                .deserialize(graph.root_id(), &graph.to_map())
                .unwrap();
            prop_assert_eq!(decoded.get(&format!("@({k})values")), Some(Value::List(values)));
        }
    }
}
