//! A bounded key-value store with an explicit access history.
//!
//! The [`HistoryCache`] keeps its entries in a map, and separately keeps track of the order in
//! which keys were touched. Which operations count as a "touch" is decided once per cache by its
//! [`HistoryPolicy`]. The cache never evicts on its own: the owner calls
//! [`keep_last`](HistoryCache::keep_last) whenever it wants to bring the cache back into bounds,
//! and receives the evicted values so it can release whatever they hold on to.
//!
//! The cache is not thread-safe. Within the loader it is exclusively owned by the actor.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;

use rustc_hash::FxHashMap;
use serde::Deserialize;

/// Controls which cache operations move a key to the front of the access history.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryPolicy {
    /// Every [`get`](HistoryCache::get) touches the key, including misses.
    #[default]
    OnGet,
    /// Only successful lookups touch the key.
    OnHit,
    /// Lookups never touch the key, only [`put`](HistoryCache::put) does.
    OnPut,
    /// The history is only updated by [`push_key_in_history`](HistoryCache::push_key_in_history).
    Manual,
}

impl HistoryPolicy {
    fn touches_on_get(self, hit: bool) -> bool {
        match self {
            HistoryPolicy::OnGet => true,
            HistoryPolicy::OnHit => hit,
            HistoryPolicy::OnPut | HistoryPolicy::Manual => false,
        }
    }

    fn touches_on_put(self) -> bool {
        !matches!(self, HistoryPolicy::Manual)
    }
}

/// A bounded, access-ordered key-value store.
pub struct HistoryCache<K, V> {
    policy: HistoryPolicy,
    entries: FxHashMap<K, V>,
    /// Maps keys to their current stamp in `order`.
    stamps: FxHashMap<K, u64>,
    /// Keys ordered by the time they were last touched. Higher stamps are more recent.
    order: BTreeMap<u64, K>,
    next_stamp: u64,
}

impl<K, V> fmt::Debug for HistoryCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryCache")
            .field("policy", &self.policy)
            .field("entries", &self.entries.len())
            .field("history", &self.order.len())
            .finish()
    }
}

impl<K, V> Default for HistoryCache<K, V> {
    fn default() -> Self {
        Self::new(HistoryPolicy::default())
    }
}

impl<K, V> HistoryCache<K, V> {
    /// Creates an empty cache using the given history policy.
    pub fn new(policy: HistoryPolicy) -> Self {
        Self {
            policy,
            entries: FxHashMap::default(),
            stamps: FxHashMap::default(),
            order: BTreeMap::new(),
            next_stamp: 0,
        }
    }

    /// The history policy of this cache.
    pub fn policy(&self) -> HistoryPolicy {
        self.policy
    }

    /// The number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The number of keys in the access history.
    ///
    /// This can differ from [`len`](Self::len), since misses may be recorded in the history
    /// and entries can be stored without being touched.
    pub fn history_len(&self) -> usize {
        self.order.len()
    }

    /// Removes all entries and forgets the history.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.stamps.clear();
        self.order.clear();
    }
}

impl<K, V> HistoryCache<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Looks up `key`, touching it according to the history policy.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let hit = self.entries.contains_key(key);
        if self.policy.touches_on_get(hit) {
            self.touch(key);
        }
        self.entries.get(key)
    }

    /// Looks up `key` without touching the history.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether `key` is part of the access history, regardless of whether it has an entry.
    pub fn in_history(&self, key: &K) -> bool {
        self.stamps.contains_key(key)
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        if self.policy.touches_on_put() {
            self.touch(&key);
        }
        self.entries.insert(key, value)
    }

    /// Removes `key` from both the map and the history.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        if let Some(stamp) = self.stamps.remove(key) {
            self.order.remove(&stamp);
        }
        self.entries.remove(key)
    }

    /// Explicitly moves `key` to the front of the history.
    pub fn push_key_in_history(&mut self, key: K) {
        self.touch(&key);
    }

    /// Trims the history to the `count` most recently touched keys.
    ///
    /// Nothing happens while the history holds at most `count + tolerance` keys. Once it grows
    /// beyond that, every key past position `count` is removed from the history and the map at
    /// once, and the removed values are returned, most recently touched first.
    pub fn keep_last(&mut self, count: usize, tolerance: usize) -> Vec<V> {
        if self.order.len() <= count.saturating_add(tolerance) {
            return Vec::new();
        }

        let cutoff = match self.order.keys().rev().nth(count) {
            Some(stamp) => *stamp,
            None => return Vec::new(),
        };
        // `split_off` keeps everything below the cutoff in `order`, which are the oldest stamps.
        let newest = self.order.split_off(&(cutoff + 1));
        let evicted = std::mem::replace(&mut self.order, newest);

        let mut values = Vec::with_capacity(evicted.len());
        for (_, key) in evicted.into_iter().rev() {
            self.stamps.remove(&key);
            if let Some(value) = self.entries.remove(&key) {
                values.push(value);
            }
        }
        values
    }

    fn touch(&mut self, key: &K) {
        let stamp = self.next_stamp;
        self.next_stamp += 1;

        match self.stamps.get_mut(key) {
            Some(previous) => {
                let key = self
                    .order
                    .remove(previous)
                    .unwrap_or_else(|| key.clone());
                *previous = stamp;
                self.order.insert(stamp, key);
            }
            None => {
                self.stamps.insert(key.clone(), stamp);
                self.order.insert(stamp, key.clone());
            }
        }
    }
}
