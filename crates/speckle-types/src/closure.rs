use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::id::ObjectId;

/// Descendant ids of a fragment mapped to the minimum number of detach edges
/// at which each is reachable.
///
/// Closures are built bottom-up: a parent records each detached child at
/// depth 1 and the child's own entries one level deeper, keeping the minimum
/// depth per id. Inlined children contribute their entries unchanged since no
/// detach edge separates them from the parent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Closure(BTreeMap<ObjectId, u32>);

impl Closure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` at `depth`, keeping the smaller depth if already present.
    /// Returns `true` if the stored depth changed.
    pub fn insert_min(&mut self, id: ObjectId, depth: u32) -> bool {
        match self.0.get_mut(&id) {
            Some(existing) if *existing <= depth => false,
            Some(existing) => {
                *existing = depth;
                true
            }
            None => {
                self.0.insert(id, depth);
                true
            }
        }
    }

    /// Record a detached child: the child itself at depth 1 and each entry of
    /// its closure one level deeper.
    pub fn record_child(&mut self, child: ObjectId, child_closure: &Closure) {
        self.insert_min(child, 1);
        for (id, depth) in child_closure.iter() {
            self.insert_min(id, depth.saturating_add(1));
        }
    }

    /// Merge an inlined child's closure at unchanged depths.
    pub fn absorb(&mut self, other: &Closure) {
        for (id, depth) in other.iter() {
            self.insert_min(id, depth);
        }
    }

    pub fn get(&self, id: &ObjectId) -> Option<u32> {
        self.0.get(id).copied()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectId, u32)> + '_ {
        self.0.iter().map(|(id, depth)| (*id, *depth))
    }

    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.0.keys().copied()
    }

    /// Ids ordered deepest first, ties broken by id.
    ///
    /// Every fragment's detached children sit strictly deeper than the
    /// fragment itself along at least one path, so this is the order in which
    /// leaves become available before the parents that reference them.
    pub fn depth_order(&self) -> Vec<ObjectId> {
        let mut entries: Vec<(ObjectId, u32)> = self.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        entries.into_iter().map(|(id, _)| id).collect()
    }

    /// The deepest depth recorded, or 0 for an empty closure.
    pub fn max_depth(&self) -> u32 {
        self.0.values().copied().max().unwrap_or(0)
    }

    /// Read a closure from the `__closure` value of a fragment.
    ///
    /// Depths may arrive as integers or integral floats depending on the
    /// producer.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, TypeError> {
        let map = value
            .as_object()
            .ok_or_else(|| TypeError::InvalidClosure("expected a JSON object".into()))?;
        let mut closure = Self::new();
        for (key, depth) in map {
            let id = ObjectId::from_hex(key)?;
            let depth = depth
                .as_u64()
                .or_else(|| depth.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
                .ok_or_else(|| TypeError::InvalidClosure(format!("depth of {key} is not a non-negative integer")))?;
            let depth = u32::try_from(depth)
                .map_err(|_| TypeError::InvalidClosure(format!("depth of {key} out of range")))?;
            closure.insert_min(id, depth);
        }
        Ok(closure)
    }

    /// The `__closure` JSON value for this closure.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .0
            .iter()
            .map(|(id, depth)| (id.to_hex(), serde_json::Value::from(*depth)))
            .collect();
        serde_json::Value::Object(map)
    }

    pub fn into_inner(self) -> BTreeMap<ObjectId, u32> {
        self.0
    }
}

impl FromIterator<(ObjectId, u32)> for Closure {
    fn from_iter<T: IntoIterator<Item = (ObjectId, u32)>>(iter: T) -> Self {
        let mut closure = Self::new();
        for (id, depth) in iter {
            closure.insert_min(id, depth);
        }
        closure
    }
}
