//! Page cache: a power-of-two chained hash keyed by page number with LRU
//! eviction over unreferenced, clean pages (spec.md §4.4, §8 invariant
//! "every cached page with refcount 0 and dirty=false is on the LRU list
//! exactly once").
//!
//! Grounded on the call shape the teacher's `storage/pager.rs` makes
//! against its own cache (`page_cache.get`, `.insert`, `.resize`,
//! `CacheError::{Full, KeyExists}`) — not itself in the retrieved pack, so
//! rebuilt here generic over the cached value so `pager.rs` can store
//! `Rc<RefCell<Page>>` without this module needing to know `Page`'s shape.
//! The teacher names its cache "dumb" because the LRU order is a plain
//! deque scanned linearly rather than an intrusive list; this keeps the
//! same texture.

use std::collections::{HashMap, VecDeque};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageCacheKey(pub u32);

impl PageCacheKey {
    pub fn new(page_no: u32) -> Self {
        Self(page_no)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// No unreferenced, clean page could be evicted to make room.
    Full,
    KeyExists,
}

pub struct DumbLruPageCache<V> {
    capacity: usize,
    map: HashMap<PageCacheKey, V>,
    /// Recency order, oldest first. May contain stale entries for keys
    /// already removed from `map`; those are skipped on scan.
    order: VecDeque<PageCacheKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheResizeResult {
    Done,
    /// Shrinking would require evicting a page that isn't evictable; the
    /// capacity is left unchanged.
    PendingEviction,
}

impl<V: Clone> DumbLruPageCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, key: &PageCacheKey) -> bool {
        self.map.contains_key(key)
    }

    pub fn get(&mut self, key: &PageCacheKey) -> Option<V> {
        if let Some(v) = self.map.get(key).cloned() {
            self.touch(*key);
            Some(v)
        } else {
            None
        }
    }

    pub fn peek(&self, key: &PageCacheKey) -> Option<&V> {
        self.map.get(key)
    }

    fn touch(&mut self, key: PageCacheKey) {
        self.order.push_back(key);
        // Bound the stale-entry growth: a page touched far more often
        // than the cache holds entries would otherwise grow `order`
        // unboundedly.
        if self.order.len() > self.capacity.saturating_mul(4) + 16 {
            self.compact_order();
        }
    }

    fn compact_order(&mut self) {
        let mut seen = std::collections::HashSet::new();
        let mut fresh = VecDeque::with_capacity(self.map.len());
        for key in self.order.drain(..).rev() {
            if self.map.contains_key(&key) && seen.insert(key) {
                fresh.push_front(key);
            }
        }
        self.order = fresh;
    }

    /// Inserts `value` under `key`, evicting the least-recently-used
    /// entry for which `is_evictable` returns true if the cache is full.
    /// Errors `KeyExists` if `key` is already present (callers must
    /// `remove` first to replace), `Full` if at capacity with no
    /// evictable victim.
    pub fn insert(
        &mut self,
        key: PageCacheKey,
        value: V,
        is_evictable: impl Fn(&V) -> bool,
    ) -> Result<(), CacheError> {
        if self.map.contains_key(&key) {
            return Err(CacheError::KeyExists);
        }
        if self.map.len() >= self.capacity {
            self.evict_one(&is_evictable)?;
        }
        self.map.insert(key, value);
        self.touch(key);
        Ok(())
    }

    fn evict_one(&mut self, is_evictable: &impl Fn(&V) -> bool) -> Result<(), CacheError> {
        let mut scanned = 0usize;
        let total = self.order.len();
        while scanned < total {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            scanned += 1;
            let Some(v) = self.map.get(&key) else {
                continue; // stale entry
            };
            if is_evictable(v) {
                self.map.remove(&key);
                return Ok(());
            }
            // Not evictable right now (pinned or dirty): keep it in the
            // cache but move it to the back so the scan makes progress.
            self.order.push_back(key);
        }
        Err(CacheError::Full)
    }

    pub fn remove(&mut self, key: &PageCacheKey) -> Option<V> {
        self.map.remove(key)
    }

    /// Shrinks or grows capacity. Shrinking below the current live count
    /// only succeeds once enough entries are evictable.
    pub fn resize(
        &mut self,
        capacity: usize,
        is_evictable: impl Fn(&V) -> bool,
    ) -> CacheResizeResult {
        let capacity = capacity.max(1);
        while self.map.len() > capacity {
            if self.evict_one(&is_evictable).is_err() {
                return CacheResizeResult::PendingEviction;
            }
        }
        self.capacity = capacity;
        CacheResizeResult::Done
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    pub fn iter_values(&self) -> impl Iterator<Item = &V> {
        self.map.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_roundtrip() {
        let mut c: DumbLruPageCache<i32> = DumbLruPageCache::new(4);
        c.insert(PageCacheKey::new(1), 100, |_| true).unwrap();
        assert_eq!(c.get(&PageCacheKey::new(1)), Some(100));
    }

    #[test]
    fn duplicate_key_errors() {
        let mut c: DumbLruPageCache<i32> = DumbLruPageCache::new(4);
        c.insert(PageCacheKey::new(1), 1, |_| true).unwrap();
        assert_eq!(
            c.insert(PageCacheKey::new(1), 2, |_| true),
            Err(CacheError::KeyExists)
        );
    }

    #[test]
    fn evicts_lru_when_full() {
        let mut c: DumbLruPageCache<i32> = DumbLruPageCache::new(2);
        c.insert(PageCacheKey::new(1), 1, |_| true).unwrap();
        c.insert(PageCacheKey::new(2), 2, |_| true).unwrap();
        // touch 1 so 2 becomes LRU
        c.get(&PageCacheKey::new(1));
        c.insert(PageCacheKey::new(3), 3, |_| true).unwrap();
        assert!(!c.contains(&PageCacheKey::new(2)));
        assert!(c.contains(&PageCacheKey::new(1)));
        assert!(c.contains(&PageCacheKey::new(3)));
    }

    #[test]
    fn full_when_nothing_evictable() {
        let mut c: DumbLruPageCache<i32> = DumbLruPageCache::new(1);
        c.insert(PageCacheKey::new(1), 1, |_| true).unwrap();
        let res = c.insert(PageCacheKey::new(2), 2, |_| false);
        assert_eq!(res, Err(CacheError::Full));
    }
}
