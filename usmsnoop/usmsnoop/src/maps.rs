use std::convert::Infallible;
use std::hash::Hash;

use log::debug;
use quick_cache::sync::Cache;

/// A bounded, thread-safe map with LRU-style eviction.
///
/// Values are copied in and out, so a lookup followed by an update behaves
/// like a kernel map element being read and written back.
pub struct LruMap<K, V> {
    cache: Cache<K, V>,
}

impl<K, V> LruMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// `name` only shows up in logs.
    pub fn with_max_entries(name: &'static str, max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        debug!("map {name}: {max_entries} entries");
        LruMap {
            cache: Cache::new(max_entries),
        }
    }

    pub fn lookup(&self, key: &K) -> Option<V> {
        self.cache.get(key)
    }

    pub fn update(&self, key: K, value: V) {
        self.cache.insert(key, value);
    }

    /// Returns the current value, inserting `init()` first when absent.
    pub fn lookup_or_init(&self, key: &K, init: impl FnOnce() -> V) -> V {
        match self
            .cache
            .get_or_insert_with(key, || Ok::<_, Infallible>(init()))
        {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    pub fn delete(&self, key: &K) -> Option<V> {
        self.cache.remove(key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
