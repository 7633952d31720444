//! Per-kind merge engine with incremental change feeds.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Duration;
use tracing::{debug, info};

use crate::observability as events;
use crate::storage::{InMemoryStore, KeyValueStore, Mutation, StorageError, DEFAULT_SHARDS};
use crate::time::{Clock, SystemClock};

use super::cursor::ChangeCursor;
use super::merge::accepts;
use super::record::TransitRecord;

/// Store key: one record per (dataset, provider reference).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub dataset_id: String,
    pub reference: String,
}

impl RecordKey {
    #[must_use]
    pub fn new(dataset_id: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            reference: reference.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dataset_id, self.reference)
    }
}

/// A stored record and the change version it was last written at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord<R> {
    pub record: R,
    pub version: u64,
}

/// What a single merge did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeOutcome {
    /// First sighting of the key.
    Inserted,
    /// A newer update was folded into the stored record.
    Updated,
    /// Recency could not be established as newer; nothing changed.
    Discarded,
    /// No record, or a record without a usable reference.
    Ignored,
}

impl MergeOutcome {
    /// True if the store changed.
    #[must_use]
    pub const fn is_change(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated)
    }
}

type RecordBackend<R> = Arc<dyn KeyValueStore<RecordKey, StoredRecord<R>>>;
type CursorBackend = Arc<dyn KeyValueStore<String, ChangeCursor>>;

fn lock_err(context: &'static str) -> StorageError {
    StorageError::Backend(format!("poisoned lock: {context}"))
}

/// Current-state store for one data kind.
///
/// # Change feed
///
/// Every accepted write takes the next value of a store-wide version counter.
/// A requestor's cursor remembers the highest version it has seen, and
/// [`get_changes_since`](Self::get_changes_since) returns records written
/// after it. Writers hold the commit gate for reading while they assign a
/// version and store the record; readers take it for writing just long
/// enough to read the counter, so no version at or below the watermark can
/// still be in flight.
pub struct EntityStore<R: TransitRecord> {
    records: RecordBackend<R>,
    cursors: CursorBackend,
    version: AtomicU64,
    commit_gate: RwLock<()>,
    discarded: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl<R: TransitRecord> fmt::Debug for EntityStore<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("kind", &R::KIND)
            .field("version", &self.version.load(Ordering::Relaxed))
            .field("discarded", &self.discarded.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<R: TransitRecord> Default for EntityStore<R> {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl<R: TransitRecord> EntityStore<R> {
    /// In-memory store with the default shard count.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_shards(DEFAULT_SHARDS, clock)
    }

    /// In-memory store with `shards` independent locks.
    #[must_use]
    pub fn with_shards(shards: usize, clock: Arc<dyn Clock>) -> Self {
        Self::with_backends(
            Arc::new(InMemoryStore::with_shards(shards)),
            Arc::new(InMemoryStore::with_shards(shards)),
            clock,
        )
    }

    /// Store over caller-provided key-value backends.
    #[must_use]
    pub fn with_backends(records: RecordBackend<R>, cursors: CursorBackend, clock: Arc<dyn Clock>) -> Self {
        Self {
            records,
            cursors,
            version: AtomicU64::new(0),
            commit_gate: RwLock::new(()),
            discarded: AtomicU64::new(0),
            clock,
        }
    }

    /// Merges one incoming record into the store.
    ///
    /// Stale updates are dropped silently: they are counted, logged at debug
    /// and reported as [`MergeOutcome::Discarded`], never as an error.
    pub fn merge(&self, dataset_id: &str, incoming: Option<R>) -> Result<MergeOutcome, StorageError> {
        let Some(incoming) = incoming else {
            return Ok(MergeOutcome::Ignored);
        };
        let Some(reference) = incoming.reference() else {
            debug!(event = events::MERGE_IGNORED_UNKEYED, kind = %R::KIND, dataset_id, "record without reference ignored");
            return Ok(MergeOutcome::Ignored);
        };
        let key = RecordKey::new(dataset_id, reference);

        let _gate = self.commit_gate.read().map_err(|_| lock_err("entity.merge"))?;
        let mut outcome = MergeOutcome::Discarded;
        self.records.update(&key, &mut |current| match current {
            None => {
                let mut record = incoming.clone();
                record.normalize();
                outcome = MergeOutcome::Inserted;
                Mutation::Put(StoredRecord {
                    record,
                    version: self.next_version(),
                })
            }
            Some(stored) if accepts(stored.record.recorded_at(), incoming.recorded_at()) => {
                let mut record = stored.record.clone();
                record.absorb(incoming.clone());
                outcome = MergeOutcome::Updated;
                Mutation::Put(StoredRecord {
                    record,
                    version: self.next_version(),
                })
            }
            Some(_) => {
                outcome = MergeOutcome::Discarded;
                Mutation::Keep
            }
        })?;

        if outcome == MergeOutcome::Discarded {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            debug!(
                event = events::MERGE_DISCARDED_STALE,
                kind = %R::KIND,
                key = %key,
                recorded_at = ?incoming.recorded_at(),
                "stale update discarded"
            );
        }
        Ok(outcome)
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Looks up one record.
    pub fn get(&self, dataset_id: &str, reference: &str) -> Result<Option<R>, StorageError> {
        Ok(self
            .records
            .get(&RecordKey::new(dataset_id, reference))?
            .map(|stored| stored.record))
    }

    /// All current records, optionally scoped to one dataset, in write order.
    pub fn get_all(&self, dataset_id: Option<&str>) -> Result<Vec<R>, StorageError> {
        let mut entries: Vec<(RecordKey, StoredRecord<R>)> = self
            .records
            .entries()?
            .into_iter()
            .filter(|(key, _)| dataset_id.map_or(true, |ds| key.dataset_id == ds))
            .collect();
        entries.sort_by_key(|(_, stored)| stored.version);
        Ok(entries.into_iter().map(|(_, stored)| stored.record).collect())
    }

    /// Records changed since `requestor_id` last polled, optionally scoped to
    /// one dataset, then advances the requestor's cursor.
    ///
    /// A requestor that has never polled receives the full current state.
    pub fn get_changes_since(&self, requestor_id: &str, dataset_id: Option<&str>) -> Result<Vec<R>, StorageError> {
        let watermark = {
            let _gate = self.commit_gate.write().map_err(|_| lock_err("entity.changes"))?;
            self.version.load(Ordering::SeqCst)
        };
        let now = self.clock.now();
        let requestor = requestor_id.to_string();

        let from = self.cursors.get(&requestor)?.map_or(0, |c| c.version);

        let mut changed: Vec<(RecordKey, StoredRecord<R>)> = self
            .records
            .entries()?
            .into_iter()
            .filter(|(key, stored)| {
                stored.version > from
                    && stored.version <= watermark
                    && dataset_id.map_or(true, |ds| key.dataset_id == ds)
            })
            .collect();
        changed.sort_by_key(|(_, stored)| stored.version);

        self.cursors.update(&requestor, &mut |current| {
            let cursor = current.copied().unwrap_or_else(|| ChangeCursor::start(now));
            Mutation::Put(cursor.advanced(watermark, now))
        })?;

        Ok(changed.into_iter().map(|(_, stored)| stored.record).collect())
    }

    /// Removes every record of a dataset. Returns the number removed.
    pub fn clear_by_dataset(&self, dataset_id: &str) -> Result<usize, StorageError> {
        let removed = self.records.remove_if(&mut |key, _| key.dataset_id == dataset_id)?;
        info!(event = events::DATASET_CLEARED, kind = %R::KIND, dataset_id, removed, "dataset cleared");
        Ok(removed)
    }

    /// Drops cursors of requestors that have not polled within `max_idle`.
    ///
    /// A dropped requestor starts over with the full state on its next poll.
    pub fn expire_idle_cursors(&self, max_idle: Duration) -> Result<usize, StorageError> {
        let cutoff = self.clock.now() - max_idle;
        self.cursors.remove_if(&mut |_, cursor| cursor.last_polled_at < cutoff)
    }

    /// The cursor of a requestor, if it has polled.
    pub fn cursor(&self, requestor_id: &str) -> Result<Option<ChangeCursor>, StorageError> {
        self.cursors.get(&requestor_id.to_string())
    }

    /// Number of canonical keys.
    pub fn len(&self) -> Result<usize, StorageError> {
        self.records.len()
    }

    /// True if the store holds no records.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        self.records.is_empty()
    }

    /// Number of updates discarded as stale since creation.
    #[must_use]
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Highest change version assigned so far.
    #[must_use]
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
