//! Abstract key-value storage contract.
//!
//! The subscription registry and the entity stores are shared, mutable maps.
//! In a single process they live in memory; in a multi-instance deployment
//! they live in a distributed key-value store. Both must honor the same
//! contract:
//! - Every operation is atomic with respect to a single key
//! - Operations on different keys never block each other on a global lock
//! - Multi-key transitions are NOT atomic as a unit; callers that need an
//!   invariant across fields keep those fields under one key

use std::hash::Hash;

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend error.
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Connection failed (clustered backends).
    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result of a read-modify-write closure passed to [`KeyValueStore::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<V> {
    /// Leave the stored value untouched.
    Keep,
    /// Store this value.
    Put(V),
    /// Remove the key.
    Remove,
}

/// Key-value storage with atomic per-key operations.
///
/// # Concurrency
/// `update` is the single-writer-per-key primitive: the closure observes the
/// current value and decides the next one without any other writer touching
/// the same key in between. Backends built on compare-and-swap may invoke the
/// closure more than once, so closures must not have side effects beyond
/// overwriting their own captured outputs.
pub trait KeyValueStore<K, V>: Send + Sync
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + PartialEq + Send + Sync,
{
    /// Get the value for a key.
    fn get(&self, key: &K) -> Result<Option<V>, StorageError>;

    /// Store a value, returning the previous one.
    fn put(&self, key: K, value: V) -> Result<Option<V>, StorageError>;

    /// Store a value only if the key is absent. Returns the existing value otherwise.
    fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>, StorageError>;

    /// Remove a key, returning the removed value.
    fn remove(&self, key: &K) -> Result<Option<V>, StorageError>;

    /// Replace `expected` with `new` atomically.
    ///
    /// `expected == None` means "key must be absent"; `new == None` removes.
    /// Returns false (and changes nothing) when the current value differs.
    fn compare_and_swap(
        &self,
        key: &K,
        expected: Option<&V>,
        new: Option<V>,
    ) -> Result<bool, StorageError>;

    /// Atomic read-modify-write of a single key.
    fn update(
        &self,
        key: &K,
        f: &mut dyn FnMut(Option<&V>) -> Mutation<V>,
    ) -> Result<(), StorageError>;

    /// Snapshot of all entries. Order is unspecified.
    fn entries(&self) -> Result<Vec<(K, V)>, StorageError>;

    /// Remove every entry matching the predicate, returning the count removed.
    fn remove_if(&self, pred: &mut dyn FnMut(&K, &V) -> bool) -> Result<usize, StorageError>;

    /// Number of keys.
    fn len(&self) -> Result<usize, StorageError>;

    /// Returns true when no keys are stored.
    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure the contract is object-safe
    fn _assert_kv_object_safe(_: &dyn KeyValueStore<String, u64>) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Backend("poisoned lock: records".to_string());
        assert!(err.to_string().contains("poisoned lock"));

        let err = StorageError::Connection("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }
}
