use indexmap::IndexMap;
use std::hash::Hash;

/// Bounded map that evicts the least recently used entry.
///
/// Recency is the position in the underlying [`IndexMap`]: a hit moves the
/// entry to the back, eviction pops the front.
pub struct LruCache<K, V> {
    entries: IndexMap<K, V>,
    capacity: usize,
}

impl<K: Hash + Eq, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let index = self.entries.get_index_of(key)?;
        let last = self.entries.len() - 1;
        self.entries.move_index(index, last);
        self.entries.get_index(last).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: K, value: V) {
        if let Some(index) = self.entries.get_index_of(&key) {
            self.entries.shift_remove_index(index);
        } else if self.entries.len() >= self.capacity {
            self.entries.shift_remove_index(0);
        }
        self.entries.insert(key, value);
    }

    /// Drops `key` when it still maps to `value`.
    pub fn remove_if(&mut self, key: &K, value: &V) -> bool
    where
        V: PartialEq,
    {
        if self.entries.get(key) != Some(value) {
            return false;
        }
        self.entries.shift_remove(key);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(&1));
        cache.insert("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.get(&"c"), Some(&3));
        assert_eq!(cache.len(), 2);
        assert!(!cache.remove_if(&"a", &9));
        assert!(cache.remove_if(&"a", &1));
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn reinsert_replaces_value() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("a", 5);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(&5));
    }
}
