use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::{Map, Value as Json};
use speckle_types::ObjectId;

use crate::deserializer::BaseDeserializer;
use crate::error::{DeserializeError, DeserializeResult};

/// Parsed fragment body.
pub type FragmentMap = Arc<Map<String, Json>>;

/// The fragments gathered for one decode, plus the ids known not to exist.
#[derive(Debug, Default, Clone)]
pub struct FragmentSet {
    fragments: HashMap<ObjectId, FragmentMap>,
    absent: HashSet<ObjectId>,
}

impl FragmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ObjectId, map: Map<String, Json>) {
        self.absent.remove(&id);
        self.fragments.insert(id, Arc::new(map));
    }

    /// Parse and insert fragment JSON.
    pub fn insert_json(&mut self, id: ObjectId, json: &str) -> DeserializeResult<()> {
        let map = BaseDeserializer::parse(Some(id), json)?;
        self.insert(id, map);
        Ok(())
    }

    pub fn mark_absent(&mut self, id: ObjectId) {
        if !self.fragments.contains_key(&id) {
            self.absent.insert(id);
        }
    }

    pub fn get(&self, id: &ObjectId) -> Option<&FragmentMap> {
        self.fragments.get(id)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.fragments.contains_key(id)
    }

    pub fn is_absent(&self, id: &ObjectId) -> bool {
        self.absent.contains(id)
    }

    pub fn absent(&self) -> &HashSet<ObjectId> {
        &self.absent
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.fragments.keys().copied()
    }

    /// Referenced ids that are neither loaded nor known to be absent.
    ///
    /// A well-formed closure leaves nothing here; anything returned has to be
    /// fetched on demand before decoding can be planned.
    pub fn unknown_references(&self) -> DeserializeResult<Vec<ObjectId>> {
        let mut unknown = BTreeSet::new();
        for (id, map) in &self.fragments {
            for target in BaseDeserializer::references(Some(*id), map)? {
                if !self.fragments.contains_key(&target) && !self.absent.contains(&target) {
                    unknown.insert(target);
                }
            }
        }
        Ok(unknown.into_iter().collect())
    }

    /// Order in which the loaded fragments can be decoded: every fragment
    /// after all loaded fragments it references.
    ///
    /// Absent references impose no ordering. Fragments that reference each
    /// other in a loop can never be decoded and are reported as
    /// [`DeserializeError::UnresolvableDependencies`].
    pub fn dependency_order(&self) -> DeserializeResult<Vec<ObjectId>> {
        let mut waiting_on: HashMap<ObjectId, usize> = HashMap::with_capacity(self.fragments.len());
        let mut dependents: HashMap<ObjectId, Vec<ObjectId>> = HashMap::new();

        for (id, map) in &self.fragments {
            let deps: Vec<ObjectId> = BaseDeserializer::references(Some(*id), map)?
                .into_iter()
                .filter(|target| self.fragments.contains_key(target))
                .collect();
            waiting_on.insert(*id, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(*id);
            }
        }

        let mut ready: Vec<ObjectId> = waiting_on
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort();
        let mut queue: VecDeque<ObjectId> = ready.into();
        let mut order = Vec::with_capacity(self.fragments.len());

        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(parents) = dependents.get(&id) {
                for parent in parents {
                    if let Some(count) = waiting_on.get_mut(parent) {
                        *count -= 1;
                        if *count == 0 {
                            queue.push_back(*parent);
                        }
                    }
                }
            }
        }

        if order.len() < self.fragments.len() {
            let mut stuck: Vec<ObjectId> = waiting_on
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(id, _)| id)
                .collect();
            stuck.sort();
            return Err(DeserializeError::UnresolvableDependencies { ids: stuck });
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(n: u8) -> ObjectId {
        ObjectId::from_bytes([n; 16])
    }

    fn with_refs(targets: &[ObjectId]) -> Map<String, Json> {
        let refs: Vec<Json> = targets
            .iter()
            .map(|t| json!({"speckle_type": "reference", "referencedId": t.to_hex()}))
            .collect();
        json!({"speckle_type": "Base", "@items": refs})
            .as_object()
            .unwrap()
            .clone()
    }

    #[test]
    fn leaves_come_first() {
        let mut set = FragmentSet::new();
        set.insert(id(1), with_refs(&[id(2), id(3)]));
        set.insert(id(2), with_refs(&[id(3)]));
        set.insert(id(3), with_refs(&[]));
        let order = set.dependency_order().unwrap();
        assert_eq!(order, vec![id(3), id(2), id(1)]);
    }

    #[test]
    fn absent_references_do_not_block() {
        let mut set = FragmentSet::new();
        set.insert(id(1), with_refs(&[id(2)]));
        set.mark_absent(id(2));
        assert_eq!(set.dependency_order().unwrap(), vec![id(1)]);
        assert!(set.unknown_references().unwrap().is_empty());
    }

    #[test]
    fn unknown_references_are_reported() {
        let mut set = FragmentSet::new();
        set.insert(id(1), with_refs(&[id(2), id(4)]));
        set.insert(id(2), with_refs(&[]));
        assert_eq!(set.unknown_references().unwrap(), vec![id(4)]);
    }

    #[test]
    fn loops_are_unresolvable() {
        let mut set = FragmentSet::new();
        set.insert(id(1), with_refs(&[id(2)]));
        set.insert(id(2), with_refs(&[id(1)]));
        set.insert(id(3), with_refs(&[]));
        match set.dependency_order().unwrap_err() {
            DeserializeError::UnresolvableDependencies { ids } => assert_eq!(ids, vec![id(1), id(2)]),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn insert_clears_absent_mark() {
        let mut set = FragmentSet::new();
        set.mark_absent(id(1));
        assert!(set.is_absent(&id(1)));
        set.insert_json(id(1), r#"{"speckle_type":"Base"}"#).unwrap();
        assert!(!set.is_absent(&id(1)));
        assert!(set.contains(&id(1)));
    }
}
