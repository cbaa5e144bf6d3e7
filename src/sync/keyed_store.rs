//! Mutex-guarded map with upsert and predicate extraction.

use super::lock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Thread-safe key/value store.
pub struct KeyedStore<K, V> {
    map: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash, V> KeyedStore<K, V> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Insert or replace; returns the superseded value.
    pub fn upsert(&self, key: K, value: V) -> Option<V> {
        lock(&self.map).insert(key, value)
    }

    /// Insert `value`, or combine it into the existing entry with `merge`.
    pub fn upsert_with<F>(&self, key: K, value: V, merge: F)
    where
        F: FnOnce(&mut V, V),
    {
        let mut map = lock(&self.map);
        match map.get_mut(&key) {
            Some(existing) => merge(existing, value),
            None => {
                map.insert(key, value);
            }
        }
    }

    /// Remove by exact key.
    pub fn take(&self, key: &K) -> Option<V> {
        lock(&self.map).remove(key)
    }

    /// Remove the first entry matching `pred` (iteration order is unspecified).
    pub fn take_if<P>(&self, pred: P) -> Option<(K, V)>
    where
        K: Clone,
        P: Fn(&K, &V) -> bool,
    {
        let mut map = lock(&self.map);
        let key = map.iter().find(|&(k, v)| pred(k, v)).map(|(k, _)| k.clone())?;
        map.remove_entry(&key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        lock(&self.map).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.map).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.map).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.map).clear();
    }

    pub fn drain(&self) -> Vec<(K, V)> {
        lock(&self.map).drain().collect()
    }
}

impl<K: Eq + Hash, V: Clone> KeyedStore<K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        lock(&self.map).get(key).cloned()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> KeyedStore<K, V> {
    /// Non-removing predicate lookup.
    pub fn find<P>(&self, pred: P) -> Option<(K, V)>
    where
        P: Fn(&K, &V) -> bool,
    {
        lock(&self.map)
            .iter()
            .find(|&(k, v)| pred(k, v))
            .map(|(k, v)| (k.clone(), v.clone()))
    }
}

impl<K: Eq + Hash, V> Default for KeyedStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_replaces() {
        let store = KeyedStore::new();
        assert_eq!(store.upsert("gdc", 1), None);
        assert_eq!(store.upsert("gdc", 2), Some(1));
        assert_eq!(store.get(&"gdc"), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_with_merges() {
        let store: KeyedStore<u32, Vec<&str>> = KeyedStore::new();
        store.upsert_with(7, vec!["crop"], |old, new| old.extend(new));
        store.upsert_with(7, vec!["hdr"], |old, new| old.extend(new));
        assert_eq!(store.get(&7), Some(vec!["crop", "hdr"]));
    }

    #[test]
    fn test_take_and_take_if() {
        let store = KeyedStore::new();
        store.upsert(1, "a");
        store.upsert(2, "b");
        assert_eq!(store.take(&1), Some("a"));
        assert_eq!(store.take(&1), None);
        assert_eq!(store.take_if(|_, v| *v == "b"), Some((2, "b")));
        assert!(store.is_empty());
    }

    #[test]
    fn test_find_is_non_removing() {
        let store = KeyedStore::new();
        store.upsert("scaler".to_string(), 3u32);
        assert_eq!(store.find(|_, v| *v == 3), Some(("scaler".to_string(), 3)));
        assert!(store.contains_key(&"scaler".to_string()));
        store.clear();
        assert!(store.find(|_, _| true).is_none());
    }
}
