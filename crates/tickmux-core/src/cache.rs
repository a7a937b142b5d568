//! Bounded TTL cache with lazy expiry.
//!
//! An entry older than its TTL is reported absent even if it has not been
//! physically removed yet. Memory is bounded two ways: [`TtlCache::sweep`]
//! drops expired entries, and inserts beyond `capacity` reclaim the
//! oldest-inserted entries first.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::clock::SharedClock;

/// A cached value plus its insertion time and lifetime.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at_ms: u64,
    pub ttl: Duration,
    seq: u64,
}

impl<V> CacheEntry<V> {
    /// Returns `true` while `now_ms < inserted_at + ttl`.
    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.inserted_at_ms.saturating_add(self.ttl.as_millis() as u64)
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.inserted_at_ms)
    }
}

struct CacheInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    // insertion order; stale (overwritten) positions are skipped on eviction
    order: VecDeque<(K, u64)>,
    next_seq: u64,
}

/// Thread-safe TTL cache. One mutex per instance; no work is done under the
/// lock beyond map bookkeeping.
pub struct TtlCache<K, V> {
    clock: SharedClock,
    default_ttl: Duration,
    capacity: usize,
    inner: Mutex<CacheInner<K, V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(clock: SharedClock, default_ttl: Duration, capacity: usize) -> Self {
        Self {
            clock,
            default_ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the value if present and not expired. Reads never extend the TTL.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_entry(key).map(|e| e.value)
    }

    /// Returns the live entry (value plus timestamps).
    pub fn get_entry(&self, key: &K) -> Option<CacheEntry<V>> {
        let now = self.clock.now_ms();
        let inner = self.lock();
        inner
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .cloned()
    }

    /// Returns the value even if its TTL has elapsed, as long as it has not
    /// been evicted yet. Used to serve last-known data when a refresh fails.
    pub fn get_stale(&self, key: &K) -> Option<V> {
        self.lock().entries.get(key).map(|e| e.value.clone())
    }

    /// Insert with the cache's default TTL.
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    /// Insert or overwrite `key`, resetting its insertion time.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        self.put(&mut inner, key, value, ttl, now);
    }

    /// Insert only if `key` has no live entry. Returns `true` when inserted.
    pub fn try_insert(&self, key: K, value: V) -> bool {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        if inner.entries.get(&key).is_some_and(|e| e.is_live(now)) {
            return false;
        }
        self.put(&mut inner, key, value, self.default_ttl, now);
        true
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().entries.remove(key).map(|e| e.value)
    }

    /// Remove `key` only if `pred` holds for its current value.
    ///
    /// Scheduled evictions use this so a newer write to the same key is not
    /// dropped by an older timer.
    pub fn remove_if<F>(&self, key: &K, pred: F) -> bool
    where
        F: FnOnce(&CacheEntry<V>) -> bool,
    {
        let mut inner = self.lock();
        match inner.entries.get(key) {
            Some(entry) if pred(entry) => {
                inner.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Physically drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.is_live(now));
        let CacheInner { entries, order, .. } = &mut *inner;
        order.retain(|(k, seq)| entries.get(k).is_some_and(|e| e.seq == *seq));
        before - inner.entries.len()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries that are still live.
    pub fn live_len(&self) -> usize {
        let now = self.clock.now_ms();
        self.lock().entries.values().filter(|e| e.is_live(now)).count()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    fn put(&self, inner: &mut CacheInner<K, V>, key: K, value: V, ttl: Duration, now: u64) {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                inserted_at_ms: now,
                ttl,
                seq,
            },
        );
        inner.order.push_back((key, seq));
        self.enforce_capacity(inner);
    }

    fn enforce_capacity(&self, inner: &mut CacheInner<K, V>) {
        while inner.entries.len() > self.capacity {
            let Some((key, seq)) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.get(&key).is_some_and(|e| e.seq == seq) {
                inner.entries.remove(&key);
            }
        }
        // overwrites leave dead positions behind; compact once they dominate
        if inner.order.len() > self.capacity * 2 {
            let CacheInner { entries, order, .. } = inner;
            order.retain(|(k, seq)| entries.get(k).is_some_and(|e| e.seq == *seq));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheInner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("default_ttl", &self.default_ttl)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn cache(capacity: usize) -> (Arc<ManualClock>, TtlCache<String, u32>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let c = TtlCache::new(clock.clone(), Duration::from_millis(100), capacity);
        (clock, c)
    }

    #[test]
    fn value_visible_before_ttl_absent_at_ttl() {
        let (clock, c) = cache(8);
        c.insert("a".into(), 1);
        clock.advance(Duration::from_millis(99));
        assert_eq!(c.get(&"a".into()), Some(1));
        clock.advance(Duration::from_millis(1));
        assert_eq!(c.get(&"a".into()), None);
    }

    #[test]
    fn reads_do_not_extend_ttl() {
        let (clock, c) = cache(8);
        c.insert("a".into(), 1);
        for _ in 0..9 {
            clock.advance(Duration::from_millis(10));
            assert_eq!(c.get(&"a".into()), Some(1));
        }
        clock.advance(Duration::from_millis(10));
        assert_eq!(c.get(&"a".into()), None);
    }

    #[test]
    fn expired_entry_still_served_as_stale_until_swept() {
        let (clock, c) = cache(8);
        c.insert("a".into(), 7);
        clock.advance(Duration::from_millis(500));
        assert_eq!(c.get(&"a".into()), None);
        assert_eq!(c.get_stale(&"a".into()), Some(7));
        assert_eq!(c.sweep(), 1);
        assert_eq!(c.get_stale(&"a".into()), None);
    }

    #[test]
    fn capacity_reclaims_oldest_inserted() {
        let (_clock, c) = cache(2);
        c.insert("a".into(), 1);
        c.insert("b".into(), 2);
        c.insert("c".into(), 3);
        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&"a".into()), None);
        assert_eq!(c.get(&"c".into()), Some(3));
    }

    #[test]
    fn overwrite_refreshes_position() {
        let (_clock, c) = cache(2);
        c.insert("a".into(), 1);
        c.insert("b".into(), 2);
        c.insert("a".into(), 10);
        c.insert("c".into(), 3);
        // "b" is now the oldest insert
        assert_eq!(c.get(&"b".into()), None);
        assert_eq!(c.get(&"a".into()), Some(10));
    }

    #[test]
    fn remove_if_respects_predicate() {
        let (_clock, c) = cache(4);
        c.insert("k".into(), 5);
        assert!(!c.remove_if(&"k".into(), |e| e.value == 6));
        assert!(c.remove_if(&"k".into(), |e| e.value == 5));
        assert!(c.is_empty());
    }

    #[test]
    fn try_insert_only_when_absent_or_expired() {
        let (clock, c) = cache(4);
        assert!(c.try_insert("w".into(), 1));
        assert!(!c.try_insert("w".into(), 2));
        assert_eq!(c.get(&"w".into()), Some(1));
        clock.advance(Duration::from_millis(100));
        assert!(c.try_insert("w".into(), 3));
    }

    #[test]
    fn per_entry_ttl_overrides_default() {
        let (clock, c) = cache(4);
        c.insert_with_ttl("long".into(), 1, Duration::from_secs(5));
        c.insert("short".into(), 2);
        clock.advance(Duration::from_millis(200));
        assert_eq!(c.live_len(), 1);
        assert_eq!(c.get(&"long".into()), Some(1));
    }
}
