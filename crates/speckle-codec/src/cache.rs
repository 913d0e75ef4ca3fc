use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use speckle_model::Base;
use speckle_types::ObjectId;

use crate::deserializer::{DecodeLookup, RefState};

#[derive(Clone)]
enum Slot {
    InFlight,
    Done(Arc<Base>),
    Absent,
}

/// Concurrent id to decoded object map scoped to one receive.
///
/// A worker must [`try_claim`](Self::try_claim) an id before decoding it, so
/// each id is decoded at most once at a time even when several parents wait
/// on the same child. A claim ends with [`complete`](Self::complete) or, if
/// the fragment was blocked, [`release`](Self::release).
#[derive(Default)]
pub struct DecodeCache {
    slots: DashMap<ObjectId, Slot>,
}

impl DecodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for decoding. Returns `false` if it is already claimed,
    /// decoded, or known absent.
    pub fn try_claim(&self, id: ObjectId) -> bool {
        match self.slots.entry(id) {
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::InFlight);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn complete(&self, id: ObjectId, base: Arc<Base>) {
        self.slots.insert(id, Slot::Done(base));
    }

    /// Give up a claim without a result.
    pub fn release(&self, id: ObjectId) {
        self.slots.remove_if(&id, |_, slot| matches!(slot, Slot::InFlight));
    }

    pub fn mark_absent(&self, id: ObjectId) {
        self.slots.insert(id, Slot::Absent);
    }

    pub fn get(&self, id: &ObjectId) -> Option<Arc<Base>> {
        match self.slots.get(id).map(|slot| slot.clone()) {
            Some(Slot::Done(base)) => Some(base),
            _ => None,
        }
    }

    pub fn is_done(&self, id: &ObjectId) -> bool {
        matches!(self.slots.get(id).as_deref(), Some(Slot::Done(_)))
    }

    /// Number of decoded objects.
    pub fn decoded(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Done(_)))
            .count()
    }

    /// Remove and return a decoded object, ending its slot.
    pub fn take(&self, id: &ObjectId) -> Option<Arc<Base>> {
        match self.slots.remove(id) {
            Some((_, Slot::Done(base))) => Some(base),
            _ => None,
        }
    }
}

impl DecodeLookup for DecodeCache {
    fn lookup(&self, id: &ObjectId) -> RefState {
        match self.slots.get(id).map(|slot| slot.clone()) {
            Some(Slot::Done(base)) => RefState::Resolved(base),
            Some(Slot::Absent) => RefState::Absent,
            Some(Slot::InFlight) | None => RefState::Pending,
        }
    }
}

impl std::fmt::Debug for DecodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeCache")
            .field("slots", &self.slots.len())
            .field("decoded", &self.decoded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(n: u8) -> ObjectId {
        ObjectId::from_bytes([n; 16])
    }

    #[test]
    fn claim_is_exclusive() {
        let cache = DecodeCache::new();
        assert!(cache.try_claim(id(1)));
        assert!(!cache.try_claim(id(1)));
        cache.release(id(1));
        assert!(cache.try_claim(id(1)));
    }

    #[test]
    fn completed_ids_resolve() {
        let cache = DecodeCache::new();
        assert!(matches!(cache.lookup(&id(1)), RefState::Pending));
        cache.try_claim(id(1));
        assert!(matches!(cache.lookup(&id(1)), RefState::Pending));
        cache.complete(id(1), Arc::new(Base::dynamic()));
        assert!(matches!(cache.lookup(&id(1)), RefState::Resolved(_)));
        assert!(cache.is_done(&id(1)));
        assert!(!cache.try_claim(id(1)));
        cache.release(id(1));
        assert!(cache.is_done(&id(1)), "release must not drop a finished result");
        assert_eq!(cache.decoded(), 1);
        assert!(cache.take(&id(1)).is_some());
        assert!(cache.get(&id(1)).is_none());
    }

    #[test]
    fn absent_ids() {
        let cache = DecodeCache::new();
        cache.mark_absent(id(2));
        assert!(matches!(cache.lookup(&id(2)), RefState::Absent));
        assert!(!cache.try_claim(id(2)));
    }

    #[test]
    fn concurrent_claims_pick_one_winner() {
        let cache = Arc::new(DecodeCache::new());
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if cache.try_claim(id(7)) {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
