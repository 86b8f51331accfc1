//! Block cache shared by every reader the file manager opens.
//!
//! The eviction policy is S3-FIFO: new entries go to a small probationary
//! queue, entries read again before leaving it are promoted to the main queue,
//! and keys evicted from the small queue are remembered in a ghost queue so a
//! quick re-insert goes straight to main.

use std::{
    cmp::min,
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::{
        atomic::{AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

/// Maximum frequency limit for an entry in the cache.
const MAX_FREQUENCY_LIMIT: u8 = 3;

struct Entry<V> {
    value: V,
    freq: AtomicU8,
}

pub struct Cache<K, V>
where
    K: Eq + Hash + Clone,
{
    max_size: usize,
    max_small_size: usize,
    /// new entries are added to this queue
    small: VecDeque<K>,
    /// entries read at least twice while in `small` are moved to this queue
    main: VecDeque<K>,
    /// keys recently evicted from `small`
    ghost: VecDeque<K>,
    ghost_keys: HashSet<K>,
    entries: HashMap<K, Entry<V>>,
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Cache {
            max_size,
            max_small_size: (max_size / 10).max(1),
            small: VecDeque::new(),
            main: VecDeque::new(),
            ghost: VecDeque::new(),
            ghost_keys: HashSet::new(),
            entries: HashMap::new(),
            stats: Stats::default(),
        }
    }

    /// Returns a reference to the value of the given key if it exists in the cache.
    pub fn get(&self, key: &K) -> Option<&V> {
        match self.entries.get(key) {
            Some(entry) => {
                let freq = min(entry.freq.load(Ordering::Relaxed) + 1, MAX_FREQUENCY_LIMIT);
                entry.freq.store(freq, Ordering::Relaxed);
                self.stats.hit();
                Some(&entry.value)
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.value = value;
            return;
        }

        while self.entries.len() >= self.max_size {
            self.evict();
        }

        let entry = Entry {
            value,
            freq: AtomicU8::new(0),
        };
        if self.ghost_keys.remove(&key) {
            self.ghost.retain(|k| k != &key);
            self.main.push_back(key.clone());
        } else {
            self.small.push_back(key.clone());
        }
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses)
    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    /// Removes exactly one entry.
    fn evict(&mut self) {
        loop {
            if self.small.len() >= self.max_small_size || self.main.is_empty() {
                if self.evict_small() {
                    return;
                }
            } else if self.evict_main() {
                return;
            }
        }
    }

    fn evict_small(&mut self) -> bool {
        let Some(key) = self.small.pop_front() else {
            return self.evict_main();
        };
        let promote = self
            .entries
            .get(&key)
            .is_some_and(|e| e.freq.load(Ordering::Relaxed) > 1);

        if promote {
            if let Some(entry) = self.entries.get(&key) {
                entry.freq.store(0, Ordering::Relaxed);
            }
            self.main.push_back(key);
            return false;
        }

        self.entries.remove(&key);
        if self.ghost.len() >= self.max_size {
            if let Some(old) = self.ghost.pop_front() {
                self.ghost_keys.remove(&old);
            }
        }
        self.ghost_keys.insert(key.clone());
        self.ghost.push_back(key);
        true
    }

    fn evict_main(&mut self) -> bool {
        let Some(key) = self.main.pop_front() else {
            return false;
        };
        let freq = self
            .entries
            .get(&key)
            .map_or(0, |e| e.freq.load(Ordering::Relaxed));

        if freq > 0 {
            if let Some(entry) = self.entries.get(&key) {
                entry.freq.store(freq - 1, Ordering::Relaxed);
            }
            self.main.push_back(key);
            false
        } else {
            self.entries.remove(&key);
            true
        }
    }
}

#[derive(Default)]
struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

type BlockKey = (String, u64);

/// Raw blocks keyed by file name and offset. Readers share one instance for
/// data blocks and another for index blocks.
pub struct BlockCache {
    inner: Mutex<Cache<BlockKey, Arc<Vec<u8>>>>,
}

impl BlockCache {
    /// `capacity` is a number of blocks.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Cache::new(capacity)),
        }
    }

    pub fn get(&self, file: &str, offset: u64) -> Option<Arc<Vec<u8>>> {
        let inner = self.inner.lock().unwrap();
        inner.get(&(file.to_string(), offset)).cloned()
    }

    pub fn insert(&self, file: &str, offset: u64, block: Arc<Vec<u8>>) {
        self.inner
            .lock()
            .unwrap()
            .insert((file.to_string(), offset), block);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses)
    pub fn stats(&self) -> (usize, usize) {
        self.inner.lock().unwrap().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering::SeqCst;

    #[test]
    fn test_insert_and_get() {
        let mut cache = Cache::new(2);
        cache.insert("apple", "red");
        cache.insert("banana", "yellow");

        assert_eq!(cache.get(&"apple"), Some(&"red"));
        assert_eq!(cache.get(&"banana"), Some(&"yellow"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_capacity_is_respected() {
        let mut cache = Cache::new(3);
        for i in 0..20 {
            cache.insert(i, i);
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.get(&19), Some(&19));
    }

    #[test]
    fn test_frequently_read_entry_survives() {
        let mut cache = Cache::new(10);
        cache.insert(0, 0);
        cache.get(&0);
        cache.get(&0);

        for i in 1..30 {
            cache.insert(i, i);
        }

        assert_eq!(cache.get(&0), Some(&0));
    }

    #[test]
    fn test_no_memory_leaks() {
        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropCounter;

        impl Drop for DropCounter {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, SeqCst);
            }
        }

        let n = 50;
        for _ in 0..n {
            let mut cache = Cache::new(20);
            for i in 0..n {
                cache.insert(i, DropCounter);
            }
        }
        assert_eq!(DROP_COUNT.load(SeqCst), n * n);
    }

    #[test]
    fn test_block_cache_hit_ratio() {
        let cache = BlockCache::new(4);
        cache.insert("f1", 0, Arc::new(vec![1, 2, 3]));

        assert_eq!(cache.get("f1", 0).as_deref(), Some(&vec![1, 2, 3]));
        assert!(cache.get("f1", 4096).is_none());
        assert!(cache.get("f2", 0).is_none());

        assert_eq!(cache.stats(), (1, 2));
    }
}
