//! Sharded concurrent containers
//!
//! String-keyed map/set variants used across the gateway for routing tables,
//! limiter cells, breaker buckets and the balancer cache. Reads take a shard
//! read lock, writes a shard write lock, so read-mostly tables (the common
//! case on the request path) never contend with each other.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

use parking_lot::RwLock;

const DEFAULT_SHARDS: usize = 16;

/// Sharded concurrent map with string keys.
///
/// Iteration (`range`, `keys`, `values`) holds shard read locks while it
/// walks entries. The container is not reentrant: calling a mutating method
/// from inside a `range` callback on the same map deadlocks on the shard
/// lock. Callers that need to mutate during a scan should collect keys first.
pub struct ShardedMap<V> {
    shards: Vec<RwLock<HashMap<String, V>>>,
    hasher: RandomState,
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ShardedMap<V> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard_for(&self, key: &str) -> &RwLock<HashMap<String, V>> {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        let idx = (h.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        self.shard_for(&key).write().insert(key, value);
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.shard_for(key).write().remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shard_for(key).read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.len());
        for shard in &self.shards {
            out.extend(shard.read().keys().cloned());
        }
        out
    }

    /// Visit every entry until `f` returns `false`.
    ///
    /// Holds one shard read lock at a time; see the type-level note on
    /// reentrancy.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&str, &V) -> bool,
    {
        for shard in &self.shards {
            let guard = shard.read();
            for (k, v) in guard.iter() {
                if !f(k, v) {
                    return;
                }
            }
        }
    }

    /// Keep only entries for which `f` returns `true`.
    pub fn retain<F>(&self, mut f: F)
    where
        F: FnMut(&str, &mut V) -> bool,
    {
        for shard in &self.shards {
            shard.write().retain(|k, v| f(k, v));
        }
    }
}

impl<V: Clone> ShardedMap<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        self.shard_for(key).read().get(key).cloned()
    }

    pub fn get_or_insert_with<F>(&self, key: &str, f: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(v) = self.get(key) {
            return v;
        }
        let mut guard = self.shard_for(key).write();
        guard.entry(key.to_string()).or_insert_with(f).clone()
    }

    pub fn values(&self) -> Vec<V> {
        let mut out = Vec::with_capacity(self.len());
        for shard in &self.shards {
            out.extend(shard.read().values().cloned());
        }
        out
    }
}

/// Sharded concurrent string set, a thin wrapper over [`ShardedMap`].
pub struct ShardedSet {
    inner: ShardedMap<()>,
}

impl Default for ShardedSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedSet {
    pub fn new() -> Self {
        Self {
            inner: ShardedMap::new(),
        }
    }

    pub fn add(&self, value: impl Into<String>) {
        self.inner.insert(value, ());
    }

    pub fn contains(&self, value: &str) -> bool {
        self.inner.contains_key(value)
    }

    pub fn remove(&self, value: &str) {
        self.inner.remove(value);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn list(&self) -> Vec<String> {
        self.inner.keys()
    }
}

/// Insertion-ordered map guarded by a single lock.
///
/// Used where registration order is semantically meaningful (forwarding
/// rules, modifier registration). Not sharded: these tables are tiny and
/// written once at startup.
pub struct OrderedMap<V> {
    inner: RwLock<OrderedMapInner<V>>,
}

struct OrderedMapInner<V> {
    order: Vec<String>,
    values: HashMap<String, V>,
}

impl<V> Default for OrderedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> OrderedMap<V> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(OrderedMapInner {
                order: Vec::new(),
                values: HashMap::new(),
            }),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let mut guard = self.inner.write();
        if !guard.values.contains_key(&key) {
            guard.order.push(key.clone());
        }
        guard.values.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().order.is_empty()
    }

    /// Visit entries in insertion order until `f` returns `false`.
    pub fn range<F>(&self, mut f: F)
    where
        F: FnMut(&str, &V) -> bool,
    {
        let guard = self.inner.read();
        for key in &guard.order {
            if let Some(v) = guard.values.get(key) {
                if !f(key, v) {
                    return;
                }
            }
        }
    }
}

impl<V: Clone> OrderedMap<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.read().values.get(key).cloned()
    }

    pub fn values_ordered(&self) -> Vec<V> {
        let guard = self.inner.read();
        guard
            .order
            .iter()
            .filter_map(|k| guard.values.get(k).cloned())
            .collect()
    }
}
