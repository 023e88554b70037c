use std::hash::{BuildHasher, Hash};

use foldhash::fast::FixedState;

const SEED: u64 = 0x6a09_e667_f3bc_c908;

/// Fixed-size, single-probe hash table.
///
/// Each key maps to exactly one slot; inserting a key that collides with an occupied slot
/// evicts the previous entry. Lookups may therefore miss a key that was inserted earlier, but
/// they compare the full key and never return the value of a different key.
#[derive(Clone, Debug)]
pub struct ConservativeMap<K, V> {
    slots: Vec<Option<(K, V)>>,
    mask: usize,
    hasher: FixedState,
}

impl<K: Hash + Eq, V> ConservativeMap<K, V> {
    /// `capacity` is rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            slots: std::iter::repeat_with(|| None).take(capacity).collect(),
            mask: capacity - 1,
            hasher: FixedState::with_seed(SEED),
        }
    }

    fn slot(&self, key: &K) -> usize {
        self.hasher.hash_one(key) as usize & self.mask
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        match &self.slots[self.slot(key)] {
            Some((stored, value)) if stored == key => Some(value),
            _ => None,
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        let slot = self.slot(&key);
        self.slots[slot] = Some((key, value));
    }

    /// Forgets every entry.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_returns_another_keys_value() {
        let mut map = ConservativeMap::new(4);
        for key in 0..64u32 {
            map.insert(key, key * 10);
            assert_eq!(map.get(&key), Some(&(key * 10)));
        }

        // Older keys may have been evicted, but a hit always belongs to its key.
        for key in 0..64u32 {
            if let Some(value) = map.get(&key) {
                assert_eq!(*value, key * 10);
            }
        }
        assert!(map.len() <= map.capacity());
    }

    #[test]
    fn reset_forgets_everything() {
        let mut map = ConservativeMap::new(3);
        assert_eq!(map.capacity(), 4);

        map.insert("linear", 1);
        assert_eq!(map.get(&"linear"), Some(&1));

        map.reset();
        assert!(map.is_empty());
        assert_eq!(map.get(&"linear"), None);
    }
}
