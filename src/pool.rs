//! Bookkeeping for open file handles: the idle cache and the set of handles
//! currently checked out by scans.
//!
//! Neither structure performs I/O. Handles leaving the cache are returned to
//! the caller, which closes them after dropping the file manager's lock.
//!
//! The cache orders entries two ways on purpose: reuse takes the most recently
//! released handle of a file (it is the warmest), while eviction takes the
//! least recently released handle across all files.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::handle::{FileHandle, HandleId};

struct CachedHandle {
    handle: FileHandle,
    released_at: Instant,
    seq: u64,
}

/// Idle handles keyed by file name.
#[derive(Default)]
pub struct HandleCache {
    /// Per-file idle handles, oldest release at the front.
    files: HashMap<String, VecDeque<CachedHandle>>,
    /// Release order across all files: sequence number to file name.
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl HandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Number of idle handles cached for `file`.
    pub fn count(&self, file: &str) -> usize {
        self.files.get(file).map_or(0, VecDeque::len)
    }

    /// Caches a released handle, stamped with its release time.
    pub fn insert(&mut self, file: String, handle: FileHandle, released_at: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.order.insert(seq, file.clone());
        self.files.entry(file).or_default().push_back(CachedHandle {
            handle,
            released_at,
            seq,
        });
    }

    /// Takes one cached handle for each requested file where one exists,
    /// preferring the most recently released. Returns the reused handles and
    /// the files that still have to be opened, in request order.
    pub fn take_cached(&mut self, files: &[String]) -> (Vec<(String, FileHandle)>, Vec<String>) {
        let mut reused = Vec::new();
        let mut to_open = Vec::new();

        for file in files {
            match self.pop_newest(file) {
                Some(handle) => reused.push((file.clone(), handle)),
                None => to_open.push(file.clone()),
            }
        }

        (reused, to_open)
    }

    /// Removes the `k` least recently released handles across all files.
    pub fn evict_oldest(&mut self, k: usize) -> Vec<FileHandle> {
        let mut evicted = Vec::with_capacity(k);

        while evicted.len() < k {
            let Some((seq, file)) = self.order.pop_first() else {
                break;
            };
            let list = self
                .files
                .get_mut(&file)
                .expect("release order references a file with no cached handles");

            // The globally oldest entry of a file is its own oldest entry.
            let entry = list.pop_front().expect("cached handle list is empty");
            debug_assert_eq!(entry.seq, seq);
            if list.is_empty() {
                self.files.remove(&file);
            }
            evicted.push(entry.handle);
        }

        evicted
    }

    /// Removes every handle released more than `max_idle` before `now`.
    pub fn take_idle(&mut self, now: Instant, max_idle: Duration) -> Vec<FileHandle> {
        let mut idle = Vec::new();
        let order = &mut self.order;

        self.files.retain(|_, list| {
            list.retain_mut(|entry| {
                if now.saturating_duration_since(entry.released_at) > max_idle {
                    order.remove(&entry.seq);
                    idle.push(entry.handle.clone());
                    false
                } else {
                    true
                }
            });
            !list.is_empty()
        });

        idle
    }

    /// Removes every cached handle.
    pub fn drain(&mut self) -> Vec<FileHandle> {
        self.order.clear();
        self.files
            .drain()
            .flat_map(|(_, list)| list.into_iter().map(|entry| entry.handle))
            .collect()
    }

    fn pop_newest(&mut self, file: &str) -> Option<FileHandle> {
        let list = self.files.get_mut(file)?;
        let entry = list.pop_back()?;
        if list.is_empty() {
            self.files.remove(file);
        }
        self.order.remove(&entry.seq);
        Some(entry.handle)
    }
}

/// Handles currently checked out by scans, with the file each one reads.
#[derive(Default)]
pub struct ReservationRegistry {
    reserved: HashMap<HandleId, String>,
}

impl ReservationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }

    pub fn insert(&mut self, handle: &FileHandle, file: String) {
        self.reserved.insert(handle.id(), file);
    }

    pub fn contains(&self, handle: &FileHandle) -> bool {
        self.reserved.contains_key(&handle.id())
    }

    pub fn contains_all(&self, handles: &[FileHandle]) -> bool {
        handles.iter().all(|h| self.contains(h))
    }

    pub fn file_name(&self, handle: &FileHandle) -> Option<&str> {
        self.reserved.get(&handle.id()).map(String::as_str)
    }

    pub fn remove(&mut self, handle: &FileHandle) -> Option<String> {
        self.reserved.remove(&handle.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryReader;

    fn handle() -> FileHandle {
        FileHandle::new(Box::new(MemoryReader::new(Vec::new())))
    }

    fn names(files: &[&str]) -> Vec<String> {
        files.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_take_cached_prefers_most_recent() {
        let mut cache = HandleCache::new();
        let now = Instant::now();
        let (old, new) = (handle(), handle());

        cache.insert("f1".into(), old.clone(), now);
        cache.insert("f1".into(), new.clone(), now + Duration::from_secs(1));

        let (reused, to_open) = cache.take_cached(&names(&["f1", "f2"]));
        assert_eq!(reused, vec![("f1".to_string(), new)]);
        assert_eq!(to_open, names(&["f2"]));
        assert_eq!(cache.count("f1"), 1);
        assert_eq!(cache.len(), 1);

        let (reused, _) = cache.take_cached(&names(&["f1"]));
        assert_eq!(reused, vec![("f1".to_string(), old)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_oldest_is_global() {
        let mut cache = HandleCache::new();
        let now = Instant::now();
        let a1 = handle();
        let b1 = handle();
        let a2 = handle();

        cache.insert("a".into(), a1.clone(), now);
        cache.insert("b".into(), b1.clone(), now);
        cache.insert("a".into(), a2.clone(), now);

        assert_eq!(cache.evict_oldest(2), vec![a1, b1]);
        assert_eq!(cache.count("a"), 1);
        assert_eq!(cache.count("b"), 0);

        // Asking for more than is cached returns what there is.
        assert_eq!(cache.evict_oldest(5), vec![a2]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reuse_and_eviction_orders_differ() {
        let mut cache = HandleCache::new();
        let now = Instant::now();
        let first = handle();
        let second = handle();

        cache.insert("f".into(), first.clone(), now);
        cache.insert("f".into(), second.clone(), now);

        // Reuse takes the newest, leaving the oldest as the eviction candidate.
        let (reused, _) = cache.take_cached(&names(&["f"]));
        assert_eq!(reused[0].1, second);
        assert_eq!(cache.evict_oldest(1), vec![first]);
    }

    #[test]
    fn test_take_idle() {
        let mut cache = HandleCache::new();
        let start = Instant::now();
        let stale = handle();
        let fresh = handle();

        cache.insert("f1".into(), stale.clone(), start);
        cache.insert("f2".into(), fresh.clone(), start + Duration::from_secs(8));

        let idle = cache.take_idle(start + Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(idle, vec![stale]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.count("f2"), 1);

        // The remaining entry is still reachable through both orderings.
        assert_eq!(cache.evict_oldest(1), vec![fresh]);
    }

    #[test]
    fn test_registry() {
        let mut registry = ReservationRegistry::new();
        let (a, b) = (handle(), handle());

        registry.insert(&a, "f1".into());
        assert!(registry.contains(&a));
        assert!(!registry.contains_all(&[a.clone(), b.clone()]));
        assert_eq!(registry.file_name(&a), Some("f1"));

        assert_eq!(registry.remove(&a), Some("f1".to_string()));
        assert!(registry.is_empty());
        assert_eq!(registry.remove(&b), None);
    }
}
