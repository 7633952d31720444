//! In-memory storage backend.
//!
//! Thread-safe, sharded implementation of [`KeyValueStore`]. Each shard is an
//! independent `RwLock<HashMap>`, so writers to different keys only contend
//! when their keys hash to the same shard. It is intended for single-process
//! deployments, tests, and as the reference implementation of the contract.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::RwLock;

use crate::storage::traits::{KeyValueStore, Mutation, StorageError};

/// Default shard count.
pub const DEFAULT_SHARDS: usize = 16;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

/// Sharded in-memory key-value store.
#[derive(Debug)]
pub struct InMemoryStore<K, V> {
    shards: Vec<RwLock<HashMap<K, V>>>,
    hasher: RandomState,
}

impl<K, V> Default for InMemoryStore<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

impl<K, V> InMemoryStore<K, V>
where
    K: Eq + Hash,
{
    /// Create a new empty store with the default shard count.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new empty store with `shards` independent locks.
    #[must_use]
    pub fn with_shards(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &K) -> &RwLock<HashMap<K, V>> {
        let idx = (self.hasher.hash_one(key) % self.shards.len() as u64) as usize;
        &self.shards[idx]
    }
}

impl<K, V> KeyValueStore<K, V> for InMemoryStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
{
    fn get(&self, key: &K) -> Result<Option<V>, StorageError> {
        let shard = self.shard(key).read().map_err(|_| lock_err("kv.get"))?;
        Ok(shard.get(key).cloned())
    }

    fn put(&self, key: K, value: V) -> Result<Option<V>, StorageError> {
        let mut shard = self.shard(&key).write().map_err(|_| lock_err("kv.put"))?;
        Ok(shard.insert(key, value))
    }

    fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>, StorageError> {
        let mut shard = self
            .shard(&key)
            .write()
            .map_err(|_| lock_err("kv.put_if_absent"))?;
        if let Some(existing) = shard.get(&key) {
            return Ok(Some(existing.clone()));
        }
        shard.insert(key, value);
        Ok(None)
    }

    fn remove(&self, key: &K) -> Result<Option<V>, StorageError> {
        let mut shard = self.shard(key).write().map_err(|_| lock_err("kv.remove"))?;
        Ok(shard.remove(key))
    }

    fn compare_and_swap(
        &self,
        key: &K,
        expected: Option<&V>,
        new: Option<V>,
    ) -> Result<bool, StorageError> {
        let mut shard = self.shard(key).write().map_err(|_| lock_err("kv.cas"))?;
        if shard.get(key) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                shard.insert(key.clone(), value);
            }
            None => {
                shard.remove(key);
            }
        }
        Ok(true)
    }

    fn update(
        &self,
        key: &K,
        f: &mut dyn FnMut(Option<&V>) -> Mutation<V>,
    ) -> Result<(), StorageError> {
        let mut shard = self.shard(key).write().map_err(|_| lock_err("kv.update"))?;
        match f(shard.get(key)) {
            Mutation::Keep => {}
            Mutation::Put(value) => {
                shard.insert(key.clone(), value);
            }
            Mutation::Remove => {
                shard.remove(key);
            }
        }
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(K, V)>, StorageError> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.read().map_err(|_| lock_err("kv.entries"))?;
            out.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Ok(out)
    }

    fn remove_if(&self, pred: &mut dyn FnMut(&K, &V) -> bool) -> Result<usize, StorageError> {
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = shard.write().map_err(|_| lock_err("kv.remove_if"))?;
            let before = guard.len();
            guard.retain(|k, v| !pred(k, v));
            removed += before - guard.len();
        }
        Ok(removed)
    }

    fn len(&self) -> Result<usize, StorageError> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().map_err(|_| lock_err("kv.len"))?.len();
        }
        Ok(total)
    }
}
