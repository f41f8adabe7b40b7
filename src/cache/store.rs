//! A bounded, insertion-ordered entity store.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

/// An entity that can live in a [`Store`].
pub trait CacheEntity: Clone {
    type Id: Copy + Eq + Hash + fmt::Debug;

    fn entity_id(&self) -> Self::Id;

    /// Folds a newer copy of the entity into `self`, field by field.
    /// Called when a store insert finds the id already resident and was not
    /// asked to replace wholesale.
    fn merge(&mut self, newer: Self);
}

/// A resident cache value. Holders of a resident observe in-place merges.
pub type Resident<V> = Arc<RwLock<V>>;

/// An insertion-ordered mapping from entity id to resident entity,
/// optionally bounded.
///
/// When bounded and at capacity, inserting a previously-absent id evicts the
/// oldest surviving entry first. Inserting an already-present id merges into
/// (or, with `replace`, substitutes) the resident value without disturbing
/// its position or identity.
#[derive(Debug)]
pub struct Store<V: CacheEntity> {
    entries: HashMap<V::Id, Resident<V>>,
    order: VecDeque<V::Id>,
    max_size: Option<usize>,
}

impl<V: CacheEntity> Default for Store<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: CacheEntity> Store<V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_size: None,
        }
    }

    /// A store holding at most `max_size` entities.
    #[must_use]
    pub fn bounded(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_size: Some(max_size),
        }
    }

    /// Inserts `value`, returning the resident entity.
    ///
    /// For an absent id this evicts the oldest entry if the store is at
    /// capacity. For a present id the resident is merged in place, or
    /// substituted wholesale when `replace` is set; either way the returned
    /// resident is the same allocation external holders already have.
    pub fn insert(&mut self, value: V, replace: bool) -> Resident<V> {
        let id = value.entity_id();

        if let Some(existing) = self.entries.get(&id) {
            if replace {
                *existing.write() = value;
            } else {
                existing.write().merge(value);
            }
            return Arc::clone(existing);
        }

        if let Some(max) = self.max_size {
            while self.entries.len() >= max.max(1) {
                match self.order.pop_front() {
                    Some(oldest) => {
                        self.entries.remove(&oldest);
                    },
                    None => break,
                }
            }
        }

        let resident = Arc::new(RwLock::new(value));
        self.entries.insert(id, Arc::clone(&resident));
        self.order.push_back(id);
        resident
    }

    pub fn get(&self, id: &V::Id) -> Option<Resident<V>> {
        self.entries.get(id).cloned()
    }

    /// A clone of the resident value, if present.
    pub fn get_cloned(&self, id: &V::Id) -> Option<V> {
        self.entries.get(id).map(|r| r.read().clone())
    }

    #[must_use]
    pub fn contains(&self, id: &V::Id) -> bool {
        self.entries.contains_key(id)
    }

    /// Removes by id, returning the removed resident.
    pub fn remove(&mut self, id: &V::Id) -> Option<Resident<V>> {
        let removed = self.entries.remove(id)?;
        self.order.retain(|key| key != id);
        Some(removed)
    }

    /// The first entity, in insertion order, matching the predicate.
    pub fn find(&self, mut predicate: impl FnMut(&V) -> bool) -> Option<Resident<V>> {
        self.order.iter().find_map(|id| {
            let resident = self.entries.get(id)?;
            predicate(&resident.read()).then(|| Arc::clone(resident))
        })
    }

    /// Clones of every entity matching the predicate, in insertion order,
    /// computed eagerly.
    pub fn filter(&self, mut predicate: impl FnMut(&V) -> bool) -> Vec<V> {
        self.order
            .iter()
            .filter_map(|id| {
                let value = self.entries.get(id)?.read();
                predicate(&value).then(|| value.clone())
            })
            .collect()
    }

    /// Maps every entity through `f`, in insertion order, eagerly.
    pub fn map_values<R>(&self, mut f: impl FnMut(&V) -> R) -> Vec<R> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|r| f(&r.read())))
            .collect()
    }

    /// A uniformly random resident, or `None` when empty.
    pub fn random(&self) -> Option<Resident<V>> {
        if self.order.is_empty() {
            return None;
        }

        let idx = rand::thread_rng().gen_range(0..self.order.len());
        self.entries.get(&self.order[idx]).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = Resident<V>> + '_ {
        self.order.iter().filter_map(|id| self.entries.get(id).cloned())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{CacheEntity, Store};

    #[derive(Clone, Debug, PartialEq)]
    struct Thing {
        id: u64,
        label: String,
        count: u32,
    }

    impl Thing {
        fn new(id: u64, label: &str) -> Self {
            Self {
                id,
                label: label.to_owned(),
                count: 0,
            }
        }
    }

    impl CacheEntity for Thing {
        type Id = u64;

        fn entity_id(&self) -> u64 {
            self.id
        }

        fn merge(&mut self, newer: Self) {
            self.label = newer.label;
            // `count` is local bookkeeping a merge must not clobber.
        }
    }

    #[test]
    fn bounded_store_evicts_the_oldest() {
        let mut store = Store::bounded(2);
        store.insert(Thing::new(1, "a"), false);
        store.insert(Thing::new(2, "b"), false);
        store.insert(Thing::new(3, "c"), false);

        assert_eq!(store.len(), 2);
        assert!(!store.contains(&1));
        assert!(store.contains(&2));
        assert!(store.contains(&3));

        // Removing shifts "oldest" to the next survivor.
        store.remove(&2);
        store.insert(Thing::new(4, "d"), false);
        store.insert(Thing::new(5, "e"), false);
        assert_eq!(store.len(), 2);
        assert!(!store.contains(&3));
        assert!(store.contains(&4) && store.contains(&5));
    }

    #[test]
    fn resident_count_never_exceeds_the_limit() {
        let mut store = Store::bounded(3);
        for id in 0..50u64 {
            store.insert(Thing::new(id, "x"), false);
            assert!(store.len() <= 3);
        }
    }

    #[test]
    fn merge_preserves_identity() {
        let mut store = Store::new();
        let first = store.insert(Thing::new(1, "before"), false);
        let second = store.insert(Thing::new(1, "after"), false);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.read().label, "after");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn merge_keeps_unmanaged_fields_while_replace_does_not() {
        let mut store = Store::new();
        store.insert(Thing::new(1, "a"), false);
        store.get(&1).unwrap().write().count = 7;

        store.insert(Thing::new(1, "b"), false);
        assert_eq!(store.get(&1).unwrap().read().count, 7);

        store.insert(Thing::new(1, "c"), true);
        assert_eq!(store.get(&1).unwrap().read().count, 0);
    }

    #[test]
    fn find_and_filter_follow_insertion_order() {
        let mut store = Store::new();
        store.insert(Thing::new(3, "x"), false);
        store.insert(Thing::new(1, "x"), false);
        store.insert(Thing::new(2, "y"), false);

        let found = store.find(|t| t.label == "x").unwrap();
        assert_eq!(found.read().id, 3);

        let filtered = store.filter(|t| t.label == "x");
        assert_eq!(filtered.iter().map(|t| t.id).collect::<Vec<_>>(), vec![3, 1]);

        let ids = store.map_values(|t| t.id);
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn remove_returns_the_resident() {
        let mut store = Store::new();
        store.insert(Thing::new(1, "a"), false);

        let removed = store.remove(&1).unwrap();
        assert_eq!(removed.read().label, "a");
        assert!(store.remove(&1).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn random_on_empty_is_none() {
        let store: Store<Thing> = Store::new();
        assert!(store.random().is_none());
    }

    #[test]
    fn random_returns_a_resident() {
        let mut store = Store::new();
        store.insert(Thing::new(1, "a"), false);
        store.insert(Thing::new(2, "b"), false);

        let got = store.random().unwrap();
        let id = got.read().id;
        assert!(id == 1 || id == 2);
    }

    #[test]
    fn reinsert_after_removal_lands_at_the_back() {
        let mut store = Store::new();
        store.insert(Thing::new(1, "a"), false);
        store.insert(Thing::new(2, "b"), false);
        store.remove(&1);
        store.insert(Thing::new(1, "a2"), false);

        assert_eq!(store.map_values(|t| t.id), vec![2, 1]);
    }
}
