//! Key-value storage contract and the in-memory backend.
//!
//! The registry and entity stores are written against [`KeyValueStore`] so a
//! clustered backend can replace [`InMemoryStore`] without touching them.

mod memory;
mod traits;

pub use memory::{InMemoryStore, DEFAULT_SHARDS};
pub use traits::{KeyValueStore, Mutation, StorageError};
